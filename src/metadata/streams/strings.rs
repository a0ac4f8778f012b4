use std::{collections::HashMap, ffi::CStr};

use crate::Result;

/// The `#Strings` heap: NUL-terminated UTF-8 identifiers addressed by byte offset.
///
/// The loaded bytes are kept as they are. Strings added later are appended, and a string that
/// already exists anywhere in the heap is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringHeap {
    data: Vec<u8>,
    original_len: usize,
    interned: Option<HashMap<Vec<u8>, u32>>,
}

impl Default for StringHeap {
    fn default() -> Self {
        StringHeap::new()
    }
}

impl StringHeap {
    /// An empty heap holding only the empty string.
    #[must_use]
    pub fn new() -> Self {
        StringHeap {
            data: vec![0],
            original_len: 1,
            interned: None,
        }
    }

    /// Wraps the bytes of a loaded heap.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty string.
    pub fn from(data: &[u8]) -> Result<StringHeap> {
        if data.is_empty() || data[0] != 0 {
            return Err(malformed_error!("Provided #Strings heap is empty"));
        }

        Ok(StringHeap {
            data: data.to_vec(),
            original_len: data.len(),
            interned: None,
        })
    }

    /// The string starting at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] past the end of the heap and
    /// [`crate::Error::Malformed`] for unterminated or non UTF-8 data.
    pub fn get(&self, index: u32) -> Result<&str> {
        let index = index as usize;
        if index >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        match CStr::from_bytes_until_nul(&self.data[index..]) {
            Ok(result) => result
                .to_str()
                .map_err(|_| malformed_error!("Invalid string at index - {}", index)),
            Err(_) => Err(malformed_error!("Unterminated string at index - {}", index)),
        }
    }

    /// The offset of `value`, appending it if the heap does not hold it yet.
    pub fn add(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        let data = &self.data;
        let interned = self.interned.get_or_insert_with(|| index_entries(data));
        if let Some(offset) = interned.get(value.as_bytes()) {
            return *offset;
        }

        #[allow(clippy::cast_possible_truncation)]
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        interned.insert(value.as_bytes().to_vec(), offset);
        offset
    }

    /// The heap bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` if strings were added since loading.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.data.len() != self.original_len
    }
}

/// Maps every string starting after a NUL to its offset; the first occurrence wins.
fn index_entries(data: &[u8]) -> HashMap<Vec<u8>, u32> {
    let mut entries = HashMap::new();
    let mut start = 1;
    while start < data.len() {
        let Some(length) = data[start..].iter().position(|byte| *byte == 0) else {
            break;
        };
        #[allow(clippy::cast_possible_truncation)]
        entries
            .entry(data[start..start + length].to_vec())
            .or_insert(start as u32);
        start += length + 1;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crafted() {
        #[rustfmt::skip]
        let data = [
            0x00,
            0x3c, 0x4d, 0x6f, 0x64, 0x75, 0x6c, 0x65, 0x3e, 0x00,
            0x53, 0x79, 0x73, 0x74, 0x65, 0x6d, 0x00,
        ];

        let heap = StringHeap::from(&data).unwrap();
        assert_eq!(heap.get(0).unwrap(), "");
        assert_eq!(heap.get(1).unwrap(), "<Module>");
        assert_eq!(heap.get(10).unwrap(), "System");
        // Offsets into the middle of a string are legal.
        assert_eq!(heap.get(13).unwrap(), "tem");
        assert!(heap.get(17).is_err());
    }

    #[test]
    fn test_add_reuses() {
        let mut heap = StringHeap::from(b"\0Main\0Item\0").unwrap();
        assert_eq!(heap.add("Item"), 6);
        assert_eq!(heap.add(""), 0);
        assert!(!heap.is_modified());

        let offset = heap.add("ItemModificationPatched");
        assert_eq!(offset, 11);
        assert_eq!(heap.add("ItemModificationPatched"), offset);
        assert_eq!(heap.get(offset).unwrap(), "ItemModificationPatched");
        assert!(heap.is_modified());
    }

    #[test]
    fn test_invalid() {
        assert!(StringHeap::from(&[]).is_err());
        assert!(StringHeap::from(b"A\0").is_err());
        let heap = StringHeap::from(b"\0abc").unwrap();
        assert!(heap.get(1).is_err());
    }
}
