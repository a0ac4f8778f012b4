use crate::{
    assembly::{Instruction, OpCode},
    scanner::check::{CheckMode, OperandCheck, Pattern},
};

/// A successful pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Index of the first matched instruction
    pub start: usize,
    /// Index one past the last consumed instruction
    pub end: usize,
    /// The local variable bound by [`CheckMode::Variable`] checks, if any
    pub variable: Option<u16>,
}

/// Outcome of matching a check list at one fixed position.
struct Attempt {
    end: usize,
    variable: Option<u16>,
}

/// Binds or re-checks the local touched by `instruction`.
fn bind(variable: &mut Option<u16>, instruction: &Instruction) -> bool {
    let Some(local) = instruction.local() else {
        return false;
    };
    match *variable {
        None => {
            *variable = Some(local);
            true
        }
        Some(bound) => bound == local,
    }
}

/// Consumes the instruction at `cursor` with `check`, advancing the cursor.
fn consume(
    instructions: &[Instruction],
    check: &OperandCheck,
    start: usize,
    cursor: &mut usize,
    variable: &mut Option<u16>,
) -> bool {
    let Some(instruction) = instructions.get(*cursor) else {
        return false;
    };
    if !check.accepts(*cursor - start, instruction) {
        return false;
    }
    if check.mode == CheckMode::Variable && !bind(variable, instruction) {
        return false;
    }
    *cursor += 1;
    true
}

/// Matches `checks` beginning exactly at `start`, with `variable` already bound or not.
fn match_at(
    instructions: &[Instruction],
    checks: &[OperandCheck],
    start: usize,
    variable: Option<u16>,
) -> Option<Attempt> {
    let mut cursor = start;
    let mut variable = variable;
    let mut previous: Option<&OperandCheck> = None;

    for (position, check) in checks.iter().enumerate() {
        match check.mode {
            CheckMode::Normal | CheckMode::Variable => {
                if !consume(instructions, check, start, &mut cursor, &mut variable) {
                    return None;
                }
                previous = Some(check);
            }
            CheckMode::Repeat(count) => {
                let repeated = previous?;
                for _ in 0..count {
                    if !consume(instructions, repeated, start, &mut cursor, &mut variable) {
                        return None;
                    }
                }
            }
            CheckMode::Skip(count) => {
                cursor = cursor.checked_add(count)?;
                if cursor > instructions.len() {
                    return None;
                }
            }
            CheckMode::SkipIndefinite => {
                let rest = &checks[position + 1..];
                return skip_to(instructions, rest, cursor, variable);
            }
        }
    }

    Some(Attempt {
        end: cursor,
        variable,
    })
}

/// Finds the first position at or after `from` where `rest` matches.
fn skip_to(
    instructions: &[Instruction],
    rest: &[OperandCheck],
    from: usize,
    variable: Option<u16>,
) -> Option<Attempt> {
    let Some(first) = rest.first() else {
        return Some(Attempt { end: from, variable });
    };

    (from..=instructions.len()).find_map(|candidate| {
        if !first.mode.is_gap()
            && !instructions
                .get(candidate)
                .is_some_and(|instruction| first.opcode.matches(instruction.opcode))
        {
            return None;
        }
        match_at(instructions, rest, candidate, variable)
    })
}

/// Finds the `occurrence`-th (0-based) match of `pattern` starting at or after `start_at`.
///
/// Only positions whose opcode satisfies the first check are tried. Each start position yields
/// at most one match, and an empty pattern or one opening with a repeat or skip never matches.
#[must_use]
pub fn find(
    instructions: &[Instruction],
    pattern: &Pattern,
    occurrence: usize,
    start_at: usize,
) -> Option<Match> {
    let checks = pattern.checks();
    let first = checks.first()?;
    if first.mode.is_gap() {
        return None;
    }

    let mut remaining = occurrence;
    for (start, instruction) in instructions.iter().enumerate().skip(start_at) {
        if !first.opcode.matches(instruction.opcode) {
            continue;
        }
        let Some(attempt) = match_at(instructions, checks, start, None) else {
            continue;
        };
        if remaining == 0 {
            log::trace!("pattern of {} checks matched at {start}..{}", checks.len(), attempt.end);
            return Some(Match {
                start,
                end: attempt.end,
                variable: attempt.variable,
            });
        }
        remaining -= 1;
    }

    None
}

/// Finds the `occurrence`-th (0-based) run of exactly `opcodes`, operands ignored.
#[must_use]
pub fn find_opcodes(
    instructions: &[Instruction],
    opcodes: &[OpCode],
    occurrence: usize,
    start_at: usize,
) -> Option<Match> {
    if opcodes.is_empty() || start_at >= instructions.len() {
        return None;
    }

    instructions[start_at..]
        .windows(opcodes.len())
        .enumerate()
        .filter(|(_, window)| {
            window
                .iter()
                .zip(opcodes)
                .all(|(instruction, opcode)| instruction.opcode == *opcode)
        })
        .nth(occurrence)
        .map(|(offset, _)| Match {
            start: start_at + offset,
            end: start_at + offset + opcodes.len(),
            variable: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Operand, SlotFamily},
        metadata::{
            references::{FieldRef, MethodRef, ResolutionScope, TypeRef},
            signatures::{MethodSig, TypeSig},
        },
        scanner::check::Predicate,
    };

    fn simple(opcodes: &[OpCode]) -> Vec<Instruction> {
        opcodes.iter().copied().map(Instruction::simple).collect()
    }

    fn item() -> TypeRef {
        TypeRef::new(ResolutionScope::Module, "Terraria", "Item")
    }

    fn item_body() -> Vec<Instruction> {
        let field = FieldRef::new(item(), "type", TypeSig::Int32);
        let method = MethodRef::new(
            item(),
            "Refresh",
            MethodSig::new_static(TypeSig::Int32, vec![TypeSig::Int32]),
        );
        vec![
            Instruction::load_argument(0),
            Instruction::new(OpCode::Ldfld, Operand::Field(field)),
            Instruction::call(method),
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::Ret),
        ]
    }

    #[test]
    fn test_normal_checks_find_first() {
        let instructions = simple(&[OpCode::Nop, OpCode::Dup, OpCode::Pop, OpCode::Dup, OpCode::Pop]);
        let pattern = Pattern::from_opcodes(&[OpCode::Dup, OpCode::Pop]);

        let found = find(&instructions, &pattern, 0, 0).unwrap();
        assert_eq!((found.start, found.end), (1, 3));
        assert_eq!(find(&instructions, &pattern, 1, 0).unwrap().start, 3);
        assert_eq!(find(&instructions, &pattern, 0, 2).unwrap().start, 3);
        assert!(find(&instructions, &pattern, 2, 0).is_none());
    }

    #[test]
    fn test_match_may_end_at_last_instruction() {
        let instructions = simple(&[OpCode::Nop, OpCode::Pop, OpCode::Ret]);
        let pattern = Pattern::from_opcodes(&[OpCode::Pop, OpCode::Ret]);
        let found = find(&instructions, &pattern, 0, 0).unwrap();
        assert_eq!((found.start, found.end), (1, 3));
    }

    #[test]
    fn test_degenerate_patterns() {
        let instructions = simple(&[OpCode::Nop, OpCode::Ret]);
        assert!(find(&instructions, &Pattern::default(), 0, 0).is_none());
        assert!(find(&instructions, &Pattern::new(vec![OperandCheck::skip(1)]), 0, 0).is_none());
        assert!(find(&instructions, &Pattern::new(vec![OperandCheck::repeat(1)]), 0, 0).is_none());
        assert!(find(&[], &Pattern::from_opcodes(&[OpCode::Ret]), 0, 0).is_none());
        assert!(find(&instructions, &Pattern::from_opcodes(&[OpCode::Ret]), 0, 7).is_none());
    }

    #[test]
    fn test_repeat_is_exact_count() {
        let pattern = Pattern::new(vec![
            OperandCheck::new(OpCode::Ldnull),
            OperandCheck::repeat(2),
            OperandCheck::new(OpCode::Ret),
        ]);

        let three = simple(&[OpCode::Ldnull, OpCode::Ldnull, OpCode::Ldnull, OpCode::Ret]);
        assert_eq!(find(&three, &pattern, 0, 0).unwrap().end, 4);

        let two = simple(&[OpCode::Ldnull, OpCode::Ldnull, OpCode::Ret]);
        assert!(find(&two, &pattern, 0, 0).is_none());

        // The fourth ldnull leaves the ret check facing an ldnull at the first start.
        let four = simple(&[OpCode::Ldnull, OpCode::Ldnull, OpCode::Ldnull, OpCode::Ldnull, OpCode::Ret]);
        assert_eq!(find(&four, &pattern, 0, 0).unwrap().start, 1);
    }

    #[test]
    fn test_variable_binding() {
        let pattern = Pattern::new(vec![
            OperandCheck::variable(SlotFamily::Stloc),
            OperandCheck::new(OpCode::Nop),
            OperandCheck::variable(SlotFamily::Ldloc),
        ]);

        let different = vec![
            Instruction::store_local(1),
            Instruction::simple(OpCode::Nop),
            Instruction::load_local(2),
        ];
        assert!(find(&different, &pattern, 0, 0).is_none());

        let same = vec![
            Instruction::store_local(7),
            Instruction::simple(OpCode::Nop),
            Instruction::load_local(7),
        ];
        assert_eq!(find(&same, &pattern, 0, 0).unwrap().variable, Some(7));
    }

    #[test]
    fn test_variable_rejects_arguments() {
        let pattern = Pattern::new(vec![OperandCheck::variable_opcode(OpCode::Ldarg0)]);
        assert!(find(&[Instruction::load_argument(0)], &pattern, 0, 0).is_none());
    }

    #[test]
    fn test_repeated_variable_keeps_binding() {
        let pattern = Pattern::new(vec![
            OperandCheck::variable(SlotFamily::Ldloc),
            OperandCheck::repeat(1),
        ]);
        let mixed = vec![Instruction::load_local(0), Instruction::load_local(1)];
        assert!(find(&mixed, &pattern, 0, 0).is_none());

        let uniform = vec![Instruction::load_local(4), Instruction::load_local(4)];
        assert_eq!(find(&uniform, &pattern, 0, 0).unwrap().variable, Some(4));
    }

    #[test]
    fn test_skip_indefinite_agrees_with_skip() {
        let instructions = simple(&[
            OpCode::Ldnull,
            OpCode::Nop,
            OpCode::Nop,
            OpCode::Nop,
            OpCode::Pop,
            OpCode::Ret,
        ]);
        let fixed = Pattern::new(vec![
            OperandCheck::new(OpCode::Ldnull),
            OperandCheck::skip(3),
            OperandCheck::new(OpCode::Pop),
        ]);
        let open = Pattern::new(vec![
            OperandCheck::new(OpCode::Ldnull),
            OperandCheck::skip_indefinite(),
            OperandCheck::new(OpCode::Pop),
        ]);

        let fixed = find(&instructions, &fixed, 0, 0).unwrap();
        assert_eq!(fixed, find(&instructions, &open, 0, 0).unwrap());
        assert_eq!(fixed.end, 5);
    }

    #[test]
    fn test_skip_past_end_fails() {
        let instructions = simple(&[OpCode::Ldnull, OpCode::Nop]);
        let pattern = Pattern::new(vec![OperandCheck::new(OpCode::Ldnull), OperandCheck::skip(2)]);
        assert!(find(&instructions, &pattern, 0, 0).is_none());

        let pattern = Pattern::new(vec![OperandCheck::new(OpCode::Ldnull), OperandCheck::skip(1)]);
        assert_eq!(find(&instructions, &pattern, 0, 0).unwrap().end, 2);
    }

    #[test]
    fn test_trailing_skip_indefinite_ends_at_cursor() {
        let instructions = simple(&[OpCode::Nop, OpCode::Ldnull, OpCode::Ret]);
        let pattern = Pattern::new(vec![OperandCheck::new(OpCode::Ldnull), OperandCheck::skip_indefinite()]);
        let found = find(&instructions, &pattern, 0, 0).unwrap();
        assert_eq!((found.start, found.end), (1, 2));
    }

    #[test]
    fn test_skip_indefinite_carries_binding() {
        let pattern = Pattern::new(vec![
            OperandCheck::variable(SlotFamily::Stloc),
            OperandCheck::skip_indefinite(),
            OperandCheck::variable(SlotFamily::Ldloc),
        ]);
        let instructions = vec![
            Instruction::store_local(3),
            Instruction::load_local(1),
            Instruction::simple(OpCode::Nop),
            Instruction::load_local(3),
        ];
        let found = find(&instructions, &pattern, 0, 0).unwrap();
        assert_eq!((found.end, found.variable), (4, Some(3)));
    }

    #[test]
    fn test_field_then_call() {
        let instructions = item_body();
        let pattern = Pattern::new(vec![
            OperandCheck::with(OpCode::Ldfld, Predicate::FieldContains("Item::type".into())),
            OperandCheck::with(OpCode::Call, Predicate::MethodContains("Refresh".into())),
        ]);
        let found = find(&instructions, &pattern, 0, 0).unwrap();
        assert_eq!((found.start, found.end), (1, 3));
    }

    #[test]
    fn test_opcode_runs() {
        let instructions = item_body();
        let found = find_opcodes(&instructions, &[OpCode::Ldfld, OpCode::Call], 0, 0).unwrap();
        assert_eq!((found.start, found.end), (1, 3));
        assert!(find_opcodes(&instructions, &[OpCode::Ldfld, OpCode::Call], 1, 0).is_none());
        assert!(find_opcodes(&instructions, &[OpCode::Ldfld], 0, 2).is_none());
        assert!(find_opcodes(&instructions, &[], 0, 0).is_none());
        assert_eq!(find_opcodes(&instructions, &[OpCode::Pop, OpCode::Ret], 0, 3).unwrap().start, 3);
    }
}
