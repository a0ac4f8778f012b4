use std::collections::HashMap;

use widestring::U16String;

use crate::{
    file::{io::write_compressed_uint, parser::Parser},
    Result,
};

/// The `#US` heap holding the literals of `ldstr`.
///
/// Every entry is a compressed byte length, the UTF-16LE code units and a trailing flag byte
/// that is 1 when the string needs more than 8-bit handling (ECMA-335 II.24.2.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStringHeap {
    data: Vec<u8>,
    original_len: usize,
    interned: Option<HashMap<String, u32>>,
}

impl Default for UserStringHeap {
    fn default() -> Self {
        UserStringHeap::new()
    }
}

impl UserStringHeap {
    /// An empty heap.
    #[must_use]
    pub fn new() -> Self {
        UserStringHeap {
            data: vec![0],
            original_len: 1,
            interned: None,
        }
    }

    /// Wraps the bytes of a loaded heap.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the heap does not start with a 0 byte.
    pub fn from(data: &[u8]) -> Result<UserStringHeap> {
        if data.is_empty() || data[0] != 0 {
            return Err(malformed_error!("Provided #US heap is empty"));
        }

        Ok(UserStringHeap {
            data: data.to_vec(),
            original_len: data.len(),
            interned: None,
        })
    }

    /// The code units of the entry at `index`, without the flag byte.
    fn units(&self, index: usize) -> Result<(Vec<u16>, usize)> {
        if index >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(&self.data[index..]);
        let length = parser.read_compressed_uint()? as usize;
        let bytes = parser.read_bytes(length)?;
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok((units, parser.pos()))
    }

    /// The string at `index`. Unpaired surrogates are replaced.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] for entries running past the heap.
    pub fn get(&self, index: u32) -> Result<String> {
        let (units, _) = self.units(index as usize)?;
        Ok(U16String::from_vec(units).to_string_lossy())
    }

    /// The index of `value`, appending it if the heap does not hold it yet.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the string is too long for a heap entry.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if self.interned.is_none() {
            self.interned = Some(self.index_entries());
        }
        if let Some(index) = self.interned.as_ref().and_then(|map| map.get(value)) {
            return Ok(*index);
        }

        let units = U16String::from_str(value).into_vec();
        let length = units.len() * 2 + 1;
        if length > 0x1FFF_FFFF {
            return Err(malformed_error!("User string of {} bytes", length));
        }

        #[allow(clippy::cast_possible_truncation)]
        let index = self.data.len() as u32;
        #[allow(clippy::cast_possible_truncation)]
        write_compressed_uint(&mut self.data, length as u32);
        for unit in &units {
            self.data.extend_from_slice(&unit.to_le_bytes());
        }
        self.data.push(u8::from(units.iter().any(|unit| needs_flag(*unit))));

        if let Some(map) = self.interned.as_mut() {
            map.insert(value.to_string(), index);
        }
        Ok(index)
    }

    fn index_entries(&self) -> HashMap<String, u32> {
        let mut entries = HashMap::new();
        let mut index = 1;
        while index < self.data.len() {
            let Ok((units, consumed)) = self.units(index) else {
                break;
            };
            // Trailing padding
            if consumed == 1 && self.data[index] == 0 {
                break;
            }
            if let Ok(value) = U16String::from_vec(units).to_string() {
                #[allow(clippy::cast_possible_truncation)]
                entries.entry(value).or_insert(index as u32);
            }
            index += consumed;
        }
        entries
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

fn needs_flag(unit: u16) -> bool {
    unit > 0x7F || matches!(unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
}
