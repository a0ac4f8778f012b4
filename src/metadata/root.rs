//! The metadata root (`BSJB` header) and its stream directory.
//!
//! [`Root`] is the first structure inside the metadata directory of the CLR header. It carries
//! the runtime version string and the [`StreamHeader`]s locating every stream relative to the
//! start of the root.
//!
//! # Reference
//! - [ECMA-335 II.24.2.1: Metadata root](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::io::{pad_to, read_le, read_le_at, write_le_to},
    metadata::streams::StreamHeader,
    Error::BinaryFormat,
    Result,
};

/// Magic signature of the metadata root, `BSJB`.
pub const CIL_HEADER_MAGIC: u32 = 0x424A_5342;

/// Version string of roots written for fresh images.
pub const DEFAULT_VERSION: &str = "v4.0.30319";

/// The header of the present metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// `MajorVersion`
    pub major_version: u16,
    /// `MinorVersion`
    pub minor_version: u16,
    /// Always 0
    pub reserved: u32,
    /// Number of bytes allocated to hold the version string, padding included
    pub length: u32,
    /// Version string without its padding
    pub version: String,
    /// Reserved, always 0
    pub flags: u16,
    /// Streams, in directory order
    pub stream_headers: Vec<StreamHeader>,
}

impl Root {
    /// A root announcing `version`, with no streams yet.
    #[must_use]
    pub fn new(version: &str) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let length = ((version.len() + 1 + 3) & !3) as u32;
        Root {
            major_version: 1,
            minor_version: 1,
            reserved: 0,
            length,
            version: version.to_string(),
            flags: 0,
            stream_headers: Vec::new(),
        }
    }

    /// Reads a [`Root`] from the start of the metadata directory.
    ///
    /// # Errors
    /// Returns [`crate::Error::BinaryFormat`] if the magic does not match,
    /// [`crate::Error::OutOfBounds`] if the data is too short and [`crate::Error::Malformed`]
    /// if a stream lies outside the metadata.
    pub fn read(data: &[u8]) -> Result<Root> {
        if data.len() < 20 {
            return Err(out_of_bounds_error!());
        }

        let signature = read_le::<u32>(data)?;
        if signature != CIL_HEADER_MAGIC {
            return Err(BinaryFormat(format!(
                "metadata root magic 0x{signature:08X} is not BSJB"
            )));
        }

        let length = read_le_at::<u32>(data, &mut 12)?;
        let Some(version_bytes) = (length as usize)
            .checked_add(16)
            .and_then(|end| data.get(16..end))
        else {
            return Err(out_of_bounds_error!());
        };
        let version: String = version_bytes
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| char::from(*byte))
            .collect();

        let mut offset = 16 + length as usize;
        let flags = read_le_at::<u16>(data, &mut offset)?;
        let stream_count = read_le_at::<u16>(data, &mut offset)?;

        let mut stream_headers = Vec::with_capacity(usize::from(stream_count));
        for _ in 0..stream_count {
            let Some(remaining) = data.get(offset..) else {
                return Err(out_of_bounds_error!());
            };
            let (header, consumed) = StreamHeader::from(remaining)?;
            if header
                .offset
                .checked_add(header.size)
                .map_or(true, |end| end as usize > data.len())
            {
                return Err(malformed_error!(
                    "Stream '{}' at 0x{:X}+0x{:X} lies outside the metadata",
                    header.name,
                    header.offset,
                    header.size
                ));
            }
            offset += consumed;
            stream_headers.push(header);
        }

        if stream_headers.is_empty() {
            return Err(malformed_error!("No valid streams have been found"));
        }

        Ok(Root {
            major_version: read_le::<u16>(&data[4..])?,
            minor_version: read_le::<u16>(&data[6..])?,
            reserved: read_le::<u32>(&data[8..])?,
            length,
            version,
            flags,
            stream_headers,
        })
    }

    /// The header of the stream called `name`.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.stream_headers.iter().find(|header| header.name == name)
    }

    /// Bytes the root and its stream directory occupy.
    #[must_use]
    pub fn header_size(&self) -> usize {
        20 + self.length as usize
            + self
                .stream_headers
                .iter()
                .map(|header| 8 + ((header.name.len() + 1 + 3) & !3))
                .sum::<usize>()
    }

    /// Writes the root followed by `streams`, given as `(name, bytes)` in directory order.
    ///
    /// Stream offsets and sizes are recomputed; each stream starts on a 4-byte boundary.
    #[must_use]
    pub fn write(&self, streams: &[(String, Vec<u8>)]) -> Vec<u8> {
        let mut directory = Vec::with_capacity(streams.len());
        let mut layout = Root {
            stream_headers: streams
                .iter()
                .map(|(name, _)| StreamHeader {
                    offset: 0,
                    size: 0,
                    name: name.clone(),
                })
                .collect(),
            ..self.clone()
        };

        let mut offset = layout.header_size();
        for (_, bytes) in streams {
            let size = (bytes.len() + 3) & !3;
            #[allow(clippy::cast_possible_truncation)]
            directory.push((offset as u32, size as u32));
            offset += size;
        }
        for (header, (offset, size)) in layout.stream_headers.iter_mut().zip(directory) {
            header.offset = offset;
            header.size = size;
        }

        let mut buffer = Vec::with_capacity(offset);
        write_le_to(&mut buffer, CIL_HEADER_MAGIC);
        write_le_to(&mut buffer, layout.major_version);
        write_le_to(&mut buffer, layout.minor_version);
        write_le_to(&mut buffer, layout.reserved);
        write_le_to(&mut buffer, layout.length);
        let start = buffer.len();
        buffer.extend_from_slice(layout.version.as_bytes());
        buffer.resize(start + layout.length as usize, 0);
        write_le_to(&mut buffer, layout.flags);
        #[allow(clippy::cast_possible_truncation)]
        write_le_to(&mut buffer, layout.stream_headers.len() as u16);
        for header in &layout.stream_headers {
            header.write(&mut buffer);
        }
        for (_, bytes) in streams {
            buffer.extend_from_slice(bytes);
            pad_to(&mut buffer, 4);
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x42, 0x53, 0x4A, 0x42,
            0x01, 0x00,
            0x01, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x08, 0x00, 0x00, 0x00,
            b'v', b'2', b'.', b'0', 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
            0x01, 0x00,
            0x28, 0x00, 0x00, 0x00, // StreamHeader
            0x04, 0x00, 0x00, 0x00,
            0x23, 0x7E, 0x00, 0x00,
            0x01, 0x02, 0x03, 0x04,
        ];

        let root = Root::read(&header_bytes).unwrap();
        assert_eq!(root.major_version, 1);
        assert_eq!(root.length, 8);
        assert_eq!(root.version, "v2.0");
        assert_eq!(root.stream_headers.len(), 1);
        assert_eq!(root.stream("#~").unwrap().offset, 0x28);
        assert_eq!(root.header_size(), 0x28);

        let written = root.write(&[("#~".to_string(), vec![1, 2, 3, 4])]);
        assert_eq!(written, header_bytes);
    }

    #[test]
    fn test_write_layout() {
        let root = Root::new(DEFAULT_VERSION);
        assert_eq!(root.length, 12);

        let written = root.write(&[
            ("#~".to_string(), vec![0xAA; 5]),
            ("#Strings".to_string(), vec![0]),
        ]);
        let read = Root::read(&written).unwrap();
        assert_eq!(read.version, DEFAULT_VERSION);
        let tables = read.stream("#~").unwrap();
        let strings = read.stream("#Strings").unwrap();
        assert_eq!(tables.offset as usize, read.header_size());
        assert_eq!(tables.size, 8);
        assert_eq!(strings.offset, tables.offset + 8);
        assert_eq!(strings.size, 4);
        assert_eq!(written.len(), strings.offset as usize + 4);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            Root::read(&[0u8; 32]),
            Err(BinaryFormat(_))
        ));

        let mut written = Root::new("v4").write(&[("#~".to_string(), vec![0; 4])]);
        // Stream size past the end of the metadata.
        let size_offset = 20 + 4 + 4;
        written[size_offset] = 0x40;
        assert!(Root::read(&written).is_err());
    }
}
