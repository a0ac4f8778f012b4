//! Declarative instruction pattern matching over method bodies.
//!
//! A [`Pattern`] is an ordered list of [`OperandCheck`]s. Each check accepts an opcode (exact, or
//! any encoding of a [`crate::assembly::SlotFamily`]), tests the operand with a [`Predicate`] and
//! has a [`CheckMode`]:
//!
//! - `Normal` consumes one instruction
//! - `Variable` consumes one instruction and binds the local variable it touches; every later
//!   variable check of the same attempt must touch the same local
//! - `Repeat(k)` requires the preceding instruction check to match exactly `k` more times
//! - `Skip(n)` passes over `n` instructions
//! - `SkipIndefinite` searches for the rest of the pattern from the cursor onwards
//!
//! Matching never mutates the body and carries no state between calls, so one pattern can be
//! reused across bodies and threads.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::assembly::{Instruction, OpCode};
//! use cilpatch::metadata::method::MethodBody;
//! use cilpatch::scanner::{scan, OperandCheck, Pattern};
//!
//! let mut body = MethodBody::new();
//! body.append(vec![
//!     Instruction::load_argument(0),
//!     Instruction::simple(OpCode::Pop),
//!     Instruction::simple(OpCode::Ret),
//! ]);
//!
//! let pattern = Pattern::new(vec![OperandCheck::new(OpCode::Pop), OperandCheck::new(OpCode::Ret)]);
//! assert_eq!(scan(&body, &pattern, 0, 0, false), Some(1));
//! assert_eq!(scan(&body, &pattern, 0, 0, true), Some(3));
//! ```

mod check;
mod matcher;

pub use check::{CheckMode, OpCodeMatcher, OperandCheck, OperandFn, Pattern, Predicate};
pub use matcher::{find, find_opcodes, Match};

use crate::{assembly::OpCode, metadata::method::MethodBody};

fn position(found: Match, return_end: bool) -> usize {
    if return_end {
        found.end
    } else {
        found.start
    }
}

/// Index of the `occurrence`-th (0-based) match of `pattern` at or after `start_at`.
///
/// With `return_end` the index one past the last consumed instruction is returned instead of
/// the first matched one.
#[must_use]
pub fn scan(
    body: &MethodBody,
    pattern: &Pattern,
    occurrence: usize,
    start_at: usize,
    return_end: bool,
) -> Option<usize> {
    find(&body.instructions, pattern, occurrence, start_at).map(|found| position(found, return_end))
}

/// The local variable bound by the `occurrence`-th match of `pattern` at or after `start_at`.
///
/// Returns `None` when there is no match or the pattern has no variable check.
#[must_use]
pub fn scan_variable(
    body: &MethodBody,
    pattern: &Pattern,
    occurrence: usize,
    start_at: usize,
) -> Option<u16> {
    find(&body.instructions, pattern, occurrence, start_at).and_then(|found| found.variable)
}

/// Index of the `occurrence`-th (0-based) run of `opcodes`, operands ignored.
#[must_use]
pub fn scan_opcodes(
    body: &MethodBody,
    opcodes: &[OpCode],
    occurrence: usize,
    start_at: usize,
    return_end: bool,
) -> Option<usize> {
    find_opcodes(&body.instructions, opcodes, occurrence, start_at)
        .map(|found| position(found, return_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{Instruction, SlotFamily};

    fn body() -> MethodBody {
        let mut body = MethodBody::new();
        body.append(vec![
            Instruction::load_int(200),
            Instruction::store_local(4),
            Instruction::load_local(4),
            Instruction::simple(OpCode::Pop),
            Instruction::load_local(4),
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::Ret),
        ]);
        body
    }

    #[test]
    fn test_positions() {
        let body = body();
        let pattern = Pattern::new(vec![
            OperandCheck::family(SlotFamily::Ldloc),
            OperandCheck::new(OpCode::Pop),
        ]);
        assert_eq!(scan(&body, &pattern, 0, 0, false), Some(2));
        assert_eq!(scan(&body, &pattern, 1, 0, false), Some(4));
        assert_eq!(scan(&body, &pattern, 1, 0, true), Some(6));
        assert_eq!(scan(&body, &pattern, 2, 0, false), None);
    }

    #[test]
    fn test_variables() {
        let body = body();
        let pattern = Pattern::new(vec![
            OperandCheck::variable(SlotFamily::Stloc),
            OperandCheck::variable(SlotFamily::Ldloc),
        ]);
        assert_eq!(scan_variable(&body, &pattern, 0, 0), Some(4));

        let plain = Pattern::from_opcodes(&[OpCode::Pop, OpCode::Ret]);
        assert_eq!(scan(&body, &plain, 0, 0, false), Some(5));
        assert_eq!(scan_variable(&body, &plain, 0, 0), None);
    }

    #[test]
    fn test_opcode_sequences() {
        let body = body();
        let run = [OpCode::LdlocS, OpCode::Pop];
        assert_eq!(scan_opcodes(&body, &run, 0, 0, false), Some(2));
        assert_eq!(scan_opcodes(&body, &run, 0, 3, true), Some(6));
        assert_eq!(scan_opcodes(&body, &run, 2, 0, false), None);
    }
}
