//! Metadata tokens.
//!
//! A token is a 32-bit value whose high byte names a metadata table and whose low 24 bits
//! are a 1-based row index. Instruction operands and signatures refer to fields, methods,
//! types and strings through tokens; the loader resolves them back into by-value references
//! and the writer re-assigns them.

use std::fmt;

/// Table identifiers used in the high byte of a [`Token`].
pub mod table {
    /// The module itself.
    pub const MODULE: u8 = 0x00;
    /// Type references into other assemblies.
    pub const TYPE_REF: u8 = 0x01;
    /// Types defined in this module.
    pub const TYPE_DEF: u8 = 0x02;
    /// Fields defined in this module.
    pub const FIELD: u8 = 0x04;
    /// Methods defined in this module.
    pub const METHOD_DEF: u8 = 0x06;
    /// Method parameters.
    pub const PARAM: u8 = 0x08;
    /// Field and method references into other assemblies.
    pub const MEMBER_REF: u8 = 0x0A;
    /// Stand-alone signatures used by `calli`.
    pub const STAND_ALONE_SIG: u8 = 0x11;
    /// Referenced modules, the scope of P/Invoke targets.
    pub const MODULE_REF: u8 = 0x1A;
    /// Constructed types: arrays, generic instances, pointers.
    pub const TYPE_SPEC: u8 = 0x1B;
    /// Referenced assemblies.
    pub const ASSEMBLY_REF: u8 = 0x23;
    /// Generic method instantiations.
    pub const METHOD_SPEC: u8 = 0x2B;
    /// The user string heap used by `ldstr`.
    pub const USER_STRING: u8 = 0x70;
}

/// A metadata token.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table id and a 1-based row.
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token((u32::from(table) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw token value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table id stored in the high byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The 1-based row index.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// The 0-based row index, or `None` for a null row.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        (self.row() as usize).checked_sub(1)
    }

    /// Returns `true` for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let token = Token::from_parts(table::METHOD_DEF, 1);
        assert_eq!(token.value(), 0x0600_0001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);
        assert_eq!(token.index(), Some(0));
    }

    #[test]
    fn test_token_null() {
        let token = Token::new(0x0A00_0000);
        assert!(!token.is_null());
        assert_eq!(token.index(), None);
        assert!(Token(0).is_null());
    }

    #[test]
    fn test_token_display() {
        let token = Token(0x06000001);
        assert_eq!(format!("{}", token), "0x06000001");
        assert_eq!(
            format!("{:?}", token),
            "Token(0x06000001, table: 0x06, row: 1)"
        );
    }
}
