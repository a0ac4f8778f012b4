use crate::{
    file::io::{read_le, write_le_to},
    Error, Result,
};

/// Longest stream name, terminator excluded.
const MAX_NAME: usize = 31;

/// One entry of the stream directory following the metadata root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset of the stream from the start of the metadata root
    pub offset: u32,
    /// Size of the stream in bytes
    pub size: u32,
    /// Stream name, e.g. `#~`
    pub name: String,
}

impl StreamHeader {
    /// Parses a header and returns it with the number of bytes it occupies.
    ///
    /// Unknown names are accepted so their streams can be carried over. The `#-` stream of
    /// unoptimized metadata is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] for truncated headers, [`crate::Error::Malformed`]
    /// for unterminated names and [`crate::Error::Unsupported`] for `#-`.
    pub fn from(data: &[u8]) -> Result<(StreamHeader, usize)> {
        if data.len() < 9 {
            return Err(out_of_bounds_error!());
        }

        let name_bytes = &data[8..data.len().min(8 + MAX_NAME + 1)];
        let Some(length) = name_bytes.iter().position(|byte| *byte == 0) else {
            return Err(malformed_error!("Unterminated stream header name"));
        };
        let name: String = name_bytes[..length].iter().map(|byte| char::from(*byte)).collect();
        if name == "#-" {
            return Err(Error::Unsupported(
                "uncompressed '#-' metadata tables".to_string(),
            ));
        }

        let header = StreamHeader {
            offset: read_le::<u32>(data)?,
            size: read_le::<u32>(&data[4..])?,
            name,
        };
        let consumed = 8 + ((length + 1 + 3) & !3);
        Ok((header, consumed))
    }

    /// Appends the header, name padded to a 4-byte boundary.
    pub fn write(&self, buffer: &mut Vec<u8>) {
        write_le_to(buffer, self.offset);
        write_le_to(buffer, self.size);
        let start = buffer.len();
        buffer.extend_from_slice(self.name.as_bytes());
        buffer.resize(start + ((self.name.len() + 1 + 3) & !3), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x6C, 0x00, 0x00, 0x00,
            0xA4, 0x45, 0x00, 0x00,
            0x23, 0x7E, 0x00, 0x00,
        ];

        let (header, consumed) = StreamHeader::from(&header_bytes).unwrap();
        assert_eq!(header.offset, 0x6C);
        assert_eq!(header.size, 0x45A4);
        assert_eq!(header.name, "#~");
        assert_eq!(consumed, 12);

        let mut written = Vec::new();
        header.write(&mut written);
        assert_eq!(written, header_bytes);
    }

    #[test]
    fn test_long_name_padding() {
        let header = StreamHeader {
            offset: 0,
            size: 4,
            name: "#Strings".to_string(),
        };
        let mut written = Vec::new();
        header.write(&mut written);
        assert_eq!(written.len(), 20);
        let (parsed, consumed) = StreamHeader::from(&written).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(consumed, 20);
    }

    #[test]
    fn test_rejected() {
        let uncompressed = [0, 0, 0, 0, 0, 0, 0, 0, b'#', b'-', 0, 0];
        assert!(matches!(
            StreamHeader::from(&uncompressed),
            Err(Error::Unsupported(_))
        ));
        let unterminated = [0, 0, 0, 0, 0, 0, 0, 0, b'#', b'U'];
        assert!(StreamHeader::from(&unterminated).is_err());
    }
}
