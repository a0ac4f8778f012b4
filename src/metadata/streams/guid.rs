use crate::Result;

/// The `#GUID` heap: 16-byte GUIDs addressed by a 1-based index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuidHeap {
    data: Vec<u8>,
    original_len: usize,
}

impl GuidHeap {
    /// An empty heap.
    #[must_use]
    pub fn new() -> Self {
        GuidHeap::default()
    }

    /// Wraps the bytes of a loaded heap. Trailing bytes short of a full GUID are kept.
    #[must_use]
    pub fn from(data: &[u8]) -> GuidHeap {
        GuidHeap {
            data: data.to_vec(),
            original_len: data.len(),
        }
    }

    /// The GUID at the 1-based `index`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] for index 0 or past the end.
    pub fn get(&self, index: u32) -> Result<uguid::Guid> {
        let Some(start) = (index as usize).checked_sub(1).map(|slot| slot * 16) else {
            return Err(out_of_bounds_error!());
        };
        let Some(bytes) = self.data.get(start..start + 16) else {
            return Err(out_of_bounds_error!());
        };

        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(bytes);
        Ok(uguid::Guid::from_bytes(buffer))
    }

    /// Appends `guid` and returns its index.
    pub fn add(&mut self, guid: uguid::Guid) -> u32 {
        // Drop padding before appending.
        self.data.truncate(self.data.len() / 16 * 16);
        self.data.extend_from_slice(&guid.to_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.data.len() / 16) as u32;
        index
    }

    /// The heap bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` if GUIDs were added since loading.
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
        #[rustfmt::skip]
        let data: [u8; 32] = [
            0x8e, 0x90, 0x37, 0xd4, 0xe6, 0x65, 0x7c, 0x48, 0x97, 0x35, 0x7b, 0xdf, 0xf6, 0x99, 0xbe, 0xa5,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
        ];

        let heap = GuidHeap::from(&data);
        assert_eq!(
            heap.get(1).unwrap(),
            uguid::guid!("d437908e-65e6-487c-9735-7bdff699bea5")
        );
        assert_eq!(
            heap.get(2).unwrap(),
            uguid::guid!("AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA")
        );
        assert!(heap.get(0).is_err());
        assert!(heap.get(3).is_err());
    }

    #[test]
    fn test_add() {
        let mut heap = GuidHeap::new();
        let guid = uguid::guid!("01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(heap.add(guid), 1);
        assert_eq!(heap.get(1).unwrap(), guid);
        assert!(heap.is_modified());
    }
}
