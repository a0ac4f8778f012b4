//! Exception handling clauses of a method body.
//!
//! Clauses are stored by instruction identity rather than by byte offset: a protected region
//! starts at `try_start` and runs up to, but not including, `try_end`. An end of `None` means
//! the region extends to the end of the method. Offsets are recomputed from the encoded
//! instruction layout whenever the body is written.

use bitflags::bitflags;

use crate::{assembly::InstructionId, metadata::references::TypeRef};

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    ///
    /// These flags determine how the exception handler processes exceptions and
    /// control flow within try/catch/finally blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause; `catch_type` names the caught type.
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause; `filter_start` marks the filter code.
        const FILTER = 0x0001;
        /// A finally clause.
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// One try/catch, try/filter, try/finally or try/fault clause.
///
/// ```text
/// try {
///     // try_start .. try_end
/// }
/// catch (catch_type) {
///     // handler_start .. handler_end
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First protected instruction
    pub try_start: InstructionId,
    /// First instruction after the protected region, `None` for end of method
    pub try_end: Option<InstructionId>,
    /// First handler instruction
    pub handler_start: InstructionId,
    /// First instruction after the handler, `None` for end of method
    pub handler_end: Option<InstructionId>,
    /// Caught type for [`ExceptionHandlerFlags::EXCEPTION`] clauses
    pub catch_type: Option<TypeRef>,
    /// First filter instruction for [`ExceptionHandlerFlags::FILTER`] clauses
    pub filter_start: Option<InstructionId>,
}

impl ExceptionHandler {
    /// Every instruction id this clause refers to.
    pub fn referenced_ids(&self) -> impl Iterator<Item = InstructionId> + '_ {
        [
            Some(self.try_start),
            self.try_end,
            Some(self.handler_start),
            self.handler_end,
            self.filter_start,
        ]
        .into_iter()
        .flatten()
    }
}

/// An exception clause as stored in the method data section, with byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawExceptionHandler {
    pub flags: u32,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Class token for typed clauses, filter offset for filter clauses
    pub class_or_filter: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_ids() {
        let handler = ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_start: InstructionId::new(1),
            try_end: Some(InstructionId::new(3)),
            handler_start: InstructionId::new(3),
            handler_end: None,
            catch_type: None,
            filter_start: None,
        };
        let ids: Vec<_> = handler.referenced_ids().map(InstructionId::value).collect();
        assert_eq!(ids, vec![1, 3, 3]);
    }
}
