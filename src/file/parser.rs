//! Cursor-based byte parser for CIL bytecode, signatures and metadata tables.
//!
//! [`Parser`] wraps a borrowed byte slice with a position and offers bounds-checked reads
//! of little-endian primitives, ECMA-335 compressed integers and tokens, and raw
//! byte runs. Every read either succeeds and advances, or fails with
//! [`crate::Error::OutOfBounds`] / [`crate::Error::Malformed`] and leaves the input untouched
//! for the caller to report.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::Parser;
//!
//! let data = [0x2A, 0xAE, 0x57, 0x49];
//! let mut parser = Parser::new(&data);
//! assert_eq!(parser.read_le::<u8>()?, 0x2A);
//! assert_eq!(parser.read_compressed_uint()?, 0x2E57);
//! assert_eq!(parser.read_compressed_token()?.value(), 0x0100_0012);
//! assert!(!parser.has_more_data());
//! # Ok::<(), cilpatch::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, CilIO},
    metadata::token::Token,
    Result,
};

/// A cursor over a byte slice.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Creates a parser positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Total length of the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` while the cursor has not reached the end.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Moves the cursor to an absolute position. Seeking to the very end is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Advances the cursor by `step` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if that would move past the end.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let end = self.calc_end_position(step)?;
        self.position = end;
        Ok(())
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// The full underlying data, independent of the cursor.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the byte at the cursor without advancing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] at the end of data.
    pub fn peek_byte(&self) -> Result<u8> {
        if self.position >= self.data.len() {
            return Err(out_of_bounds_error!());
        }
        Ok(self.data[self.position])
    }

    /// Reads a little-endian value and advances past it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if not enough data remains.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Reads an ECMA-335 compressed unsigned integer (II.23.2).
    ///
    /// # Errors
    ///
    /// Returns an error for truncated data or an invalid leading byte.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            let value = ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte);
            return Ok(value);
        }

        // 4-byte encoding: 11xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            let value = ((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3;
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Reads a compressed `TypeDefOrRef` coded index and expands it to a full token.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated data or an unknown table tag.
    pub fn read_compressed_token(&mut self) -> Result<Token> {
        let compressed_token = self.read_compressed_uint()?;

        let table: u32 = match compressed_token & 0x3 {
            0x0 => 0x0200_0000, // TypeDef
            0x1 => 0x0100_0000, // TypeRef
            0x2 => 0x1B00_0000, // TypeSpec
            _ => {
                return Err(malformed_error!(
                    "Invalid compressed token - {}",
                    compressed_token
                ))
            }
        };

        let table_index = compressed_token >> 2;

        Ok(Token::new(table + table_index))
    }

    /// Number of bytes between the cursor and the end.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Computes `pos + length`, failing if it would leave the data.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] on overflow or overrun.
    pub fn calc_end_position(&self, length: usize) -> Result<usize> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;

        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(end)
    }

    /// Borrows the next `length` bytes and advances past them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if not enough data remains.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_uint() {
        let test_cases = vec![
            (vec![0x03], 3),
            (vec![0x7F], 0x7F),
            (vec![0x80, 0x80], 0x80),
            (vec![0xAE, 0x57], 0x2E57),
            (vec![0xBF, 0xFF], 0x3FFF),
            (vec![0xC0, 0x00, 0x40, 0x00], 0x4000),
            (vec![0xDF, 0xFF, 0xFF, 0xFF], 0x1FFF_FFFF),
        ];

        for (input, expected) in test_cases {
            let mut parser = Parser::new(&input);
            let result = parser.read_compressed_uint().unwrap();
            assert_eq!(result, expected);
            assert!(!parser.has_more_data());
        }
    }

    #[test]
    fn test_compressed_uint_invalid() {
        let mut parser = Parser::new(&[0xE0, 0x00, 0x00, 0x00]);
        assert!(parser.read_compressed_uint().is_err());
    }

    #[test]
    fn test_compressed_token() {
        let mut parser = Parser::new(&[0x49]);
        let token = parser.read_compressed_token().unwrap();
        assert_eq!(token.value(), 0x0100_0012);

        let mut parser = Parser::new(&[0x08]);
        let token = parser.read_compressed_token().unwrap();
        assert_eq!(token.value(), 0x0200_0002);

        let mut parser = Parser::new(&[0x0E]);
        let token = parser.read_compressed_token().unwrap();
        assert_eq!(token.value(), 0x1B00_0003);

        assert!(Parser::new(&[0x03]).read_compressed_token().is_err());
    }

    #[test]
    fn test_seek_and_bytes() {
        let data = [1, 2, 3, 4];
        let mut parser = Parser::new(&data);
        parser.seek(4).unwrap();
        assert!(!parser.has_more_data());
        assert!(parser.seek(5).is_err());

        parser.seek(1).unwrap();
        assert_eq!(parser.read_bytes(2).unwrap(), &[2, 3]);
        assert_eq!(parser.remaining(), 1);
        assert!(parser.read_bytes(2).is_err());
    }
}
