use std::collections::HashMap;

use crate::{
    file::{io::write_compressed_uint, parser::Parser},
    Result,
};

/// The `#Blob` heap: length-prefixed byte strings, mostly signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeap {
    data: Vec<u8>,
    original_len: usize,
    interned: Option<HashMap<Vec<u8>, u32>>,
}

impl Default for BlobHeap {
    fn default() -> Self {
        BlobHeap::new()
    }
}

impl BlobHeap {
    /// An empty heap holding only the empty blob.
    #[must_use]
    pub fn new() -> Self {
        BlobHeap {
            data: vec![0],
            original_len: 1,
            interned: None,
        }
    }

    /// Wraps the bytes of a loaded heap.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty blob.
    pub fn from(data: &[u8]) -> Result<BlobHeap> {
        if data.is_empty() || data[0] != 0 {
            return Err(malformed_error!("Invalid memory for #Blob heap"));
        }

        Ok(BlobHeap {
            data: data.to_vec(),
            original_len: data.len(),
            interned: None,
        })
    }

    /// The blob at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the blob runs past the heap.
    pub fn get(&self, index: u32) -> Result<&[u8]> {
        let index = index as usize;
        if index >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(&self.data[index..]);
        let len = parser.read_compressed_uint()? as usize;
        parser.read_bytes(len)
    }

    /// The index of `blob`, appending it if the heap does not hold it yet.
    pub fn add(&mut self, blob: &[u8]) -> u32 {
        if blob.is_empty() {
            return 0;
        }
        if self.interned.is_none() {
            self.interned = Some(self.index_entries());
        }
        if let Some(index) = self.interned.as_ref().and_then(|map| map.get(blob)) {
            return *index;
        }

        #[allow(clippy::cast_possible_truncation)]
        let index = self.data.len() as u32;
        #[allow(clippy::cast_possible_truncation)]
        write_compressed_uint(&mut self.data, blob.len() as u32);
        self.data.extend_from_slice(blob);
        if let Some(map) = self.interned.as_mut() {
            map.insert(blob.to_vec(), index);
        }
        index
    }

    fn index_entries(&self) -> HashMap<Vec<u8>, u32> {
        let mut entries = HashMap::new();
        let mut index = 1;
        while index < self.data.len() {
            let mut parser = Parser::new(&self.data[index..]);
            let Ok(len) = parser.read_compressed_uint() else {
                break;
            };
            let Ok(blob) = parser.read_bytes(len as usize) else {
                break;
            };
            #[allow(clippy::cast_possible_truncation)]
            entries.entry(blob.to_vec()).or_insert(index as u32);
            index += parser.pos();
        }
        entries
    }

    /// The heap bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` if blobs were added since loading.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.data.len() != self.original_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crafted() {
        let data = [0x00, 0x03, 0x20, 0x00, 0x01, 0x02, 0x06, 0x02];
        let heap = BlobHeap::from(&data).unwrap();
        assert_eq!(heap.get(0).unwrap(), &[] as &[u8]);
        assert_eq!(heap.get(1).unwrap(), &[0x20, 0x00, 0x01]);
        assert_eq!(heap.get(5).unwrap(), &[0x06, 0x02]);
        assert!(heap.get(8).is_err());
    }

    #[test]
    fn test_add() {
        let mut heap = BlobHeap::from(&[0x00, 0x02, 0x06, 0x02]).unwrap();
        assert_eq!(heap.add(&[0x06, 0x02]), 1);
        assert!(!heap.is_modified());
        assert_eq!(heap.add(&[0x06, 0x08]), 4);
        assert_eq!(heap.get(4).unwrap(), &[0x06, 0x08]);
        assert_eq!(heap.add(&[]), 0);
    }

    #[test]
    fn test_truncated() {
        let heap = BlobHeap::from(&[0x00, 0x05, 0x01]).unwrap();
        assert!(heap.get(1).is_err());
        assert!(BlobHeap::from(&[0x01]).is_err());
    }
}
