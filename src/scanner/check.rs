//! The declarative building blocks of a [`Pattern`].

use std::{fmt, sync::Arc};

use crate::{
    assembly::{Immediate, Instruction, OpCode, Operand, SlotFamily},
    metadata::{
        references::{FieldRef, MethodRef, TypeRef},
        signatures::MethodSig,
    },
};

/// How a check participates in a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// The instruction at the cursor must satisfy the check.
    Normal,
    /// Like [`CheckMode::Normal`]; the local variable the instruction touches is bound on first
    /// use and must be the same for every later variable check of the attempt.
    Variable,
    /// The closest preceding instruction check must match exactly this many more times.
    Repeat(usize),
    /// This many instructions are passed over unchecked.
    Skip(usize),
    /// The remaining checks are searched for from the cursor onwards; the first match closes
    /// the gap.
    SkipIndefinite,
}

impl CheckMode {
    /// Returns `true` for modes that consume no instruction of their own.
    #[must_use]
    pub fn is_gap(self) -> bool {
        matches!(
            self,
            CheckMode::Repeat(_) | CheckMode::Skip(_) | CheckMode::SkipIndefinite
        )
    }
}

/// Which opcodes a check accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCodeMatcher {
    /// Any opcode
    Any,
    /// Exactly this opcode
    Exact(OpCode),
    /// Any encoding of a load/store family, e.g. `ldloc.0`, `ldloc.s` and `ldloc`
    Family(SlotFamily),
}

impl OpCodeMatcher {
    /// Returns `true` if `opcode` is accepted.
    #[must_use]
    pub fn matches(self, opcode: OpCode) -> bool {
        match self {
            OpCodeMatcher::Any => true,
            OpCodeMatcher::Exact(expected) => opcode == expected,
            OpCodeMatcher::Family(family) => family.matches(opcode),
        }
    }
}

/// A function deciding whether an operand is acceptable.
///
/// Receives the position of the instruction relative to where the pattern (or the part of it
/// after an indefinite skip) started matching.
pub type OperandFn = Arc<dyn Fn(usize, &Operand) -> bool + Send + Sync>;

/// A condition on the operand of an instruction.
///
/// Reference predicates compare Cecil-style full names, e.g.
/// `System.Void Terraria.Item::SetDefaults(System.Int32,System.Boolean)`.
#[derive(Clone)]
pub enum Predicate {
    /// Any operand
    Any,
    /// No operand; shorthand loads and stores such as `ldloc.0` count as operand-less
    NoOperand,
    /// `int32` immediate
    I4(i32),
    /// `int8` immediate
    I1(i8),
    /// `uint8` immediate
    U1(u8),
    /// `int64` immediate
    I8(i64),
    /// `float32` immediate
    R4(f32),
    /// `float64` immediate
    R8(f64),
    /// User string
    Str(String),
    /// Argument slot
    Argument(u16),
    /// Local variable slot
    Local(u16),
    /// Field with this full name
    Field(String),
    /// Method with this full name
    Method(String),
    /// Type with this full name
    Type(String),
    /// Field whose full name contains the text
    FieldContains(String),
    /// Method whose full name contains the text
    MethodContains(String),
    /// Type whose full name contains the text
    TypeContains(String),
    /// `calli` with this signature
    CallSite(MethodSig),
    /// Arbitrary test
    Custom(OperandFn),
}

impl Predicate {
    /// Matches the field `field` by full name.
    #[must_use]
    pub fn field(field: &FieldRef) -> Self {
        Predicate::Field(field.full_name())
    }

    /// Matches the method `method` by full name.
    #[must_use]
    pub fn method(method: &MethodRef) -> Self {
        Predicate::Method(method.full_name())
    }

    /// Matches the type `reference` by full name.
    #[must_use]
    pub fn type_ref(reference: &TypeRef) -> Self {
        Predicate::Type(reference.full_name())
    }

    /// Wraps a plain function.
    pub fn custom(test: impl Fn(usize, &Operand) -> bool + Send + Sync + 'static) -> Self {
        Predicate::Custom(Arc::new(test))
    }

    /// Evaluates the predicate against the instruction at `position`.
    #[must_use]
    pub fn matches(&self, position: usize, instruction: &Instruction) -> bool {
        let operand = &instruction.operand;
        match self {
            Predicate::Any => true,
            Predicate::NoOperand => {
                matches!(operand, Operand::None) || instruction.opcode.implicit_slot().is_some()
            }
            Predicate::I4(value) => matches!(operand, Operand::Immediate(Immediate::Int32(v)) if v == value),
            Predicate::I1(value) => matches!(operand, Operand::Immediate(Immediate::Int8(v)) if v == value),
            Predicate::U1(value) => matches!(operand, Operand::Immediate(Immediate::UInt8(v)) if v == value),
            Predicate::I8(value) => matches!(operand, Operand::Immediate(Immediate::Int64(v)) if v == value),
            #[allow(clippy::float_cmp)]
            Predicate::R4(value) => matches!(operand, Operand::Immediate(Immediate::Float32(v)) if v == value),
            #[allow(clippy::float_cmp)]
            Predicate::R8(value) => matches!(operand, Operand::Immediate(Immediate::Float64(v)) if v == value),
            Predicate::Str(value) => matches!(operand, Operand::String(v) if v == value),
            Predicate::Argument(index) => operand.argument() == Some(*index),
            Predicate::Local(index) => operand.local() == Some(*index),
            Predicate::Field(name) => operand.field().is_some_and(|f| f.full_name() == *name),
            Predicate::Method(name) => operand.method().is_some_and(|m| m.full_name() == *name),
            Predicate::Type(name) => operand.type_ref().is_some_and(|t| t.full_name() == *name),
            Predicate::FieldContains(text) => {
                operand.field().is_some_and(|f| f.full_name().contains(text.as_str()))
            }
            Predicate::MethodContains(text) => {
                operand.method().is_some_and(|m| m.full_name().contains(text.as_str()))
            }
            Predicate::TypeContains(text) => {
                operand.type_ref().is_some_and(|t| t.full_name().contains(text.as_str()))
            }
            Predicate::CallSite(signature) => matches!(operand, Operand::CallSite(s) if s == signature),
            Predicate::Custom(test) => test(position, operand),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Any => f.write_str("Any"),
            Predicate::NoOperand => f.write_str("NoOperand"),
            Predicate::I4(value) => write!(f, "I4({value})"),
            Predicate::I1(value) => write!(f, "I1({value})"),
            Predicate::U1(value) => write!(f, "U1({value})"),
            Predicate::I8(value) => write!(f, "I8({value})"),
            Predicate::R4(value) => write!(f, "R4({value})"),
            Predicate::R8(value) => write!(f, "R8({value})"),
            Predicate::Str(value) => write!(f, "Str({value:?})"),
            Predicate::Argument(index) => write!(f, "Argument({index})"),
            Predicate::Local(index) => write!(f, "Local({index})"),
            Predicate::Field(name) => write!(f, "Field({name:?})"),
            Predicate::Method(name) => write!(f, "Method({name:?})"),
            Predicate::Type(name) => write!(f, "Type({name:?})"),
            Predicate::FieldContains(text) => write!(f, "FieldContains({text:?})"),
            Predicate::MethodContains(text) => write!(f, "MethodContains({text:?})"),
            Predicate::TypeContains(text) => write!(f, "TypeContains({text:?})"),
            Predicate::CallSite(signature) => write!(f, "CallSite({signature:?})"),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One position of a [`Pattern`].
#[derive(Debug, Clone)]
pub struct OperandCheck {
    /// Accepted opcodes
    pub opcode: OpCodeMatcher,
    /// Condition on the operand
    pub predicate: Predicate,
    /// How the check participates in the match
    pub mode: CheckMode,
}

impl OperandCheck {
    fn instruction(opcode: OpCodeMatcher, predicate: Predicate, mode: CheckMode) -> Self {
        OperandCheck {
            opcode,
            predicate,
            mode,
        }
    }

    fn gap(mode: CheckMode) -> Self {
        Self::instruction(OpCodeMatcher::Any, Predicate::Any, mode)
    }

    /// Matches `opcode` with any operand.
    #[must_use]
    pub fn new(opcode: OpCode) -> Self {
        Self::instruction(OpCodeMatcher::Exact(opcode), Predicate::Any, CheckMode::Normal)
    }

    /// Matches `opcode` with an operand satisfying `predicate`.
    #[must_use]
    pub fn with(opcode: OpCode, predicate: Predicate) -> Self {
        Self::instruction(OpCodeMatcher::Exact(opcode), predicate, CheckMode::Normal)
    }

    /// Matches `opcode` without an operand.
    #[must_use]
    pub fn no_operand(opcode: OpCode) -> Self {
        Self::with(opcode, Predicate::NoOperand)
    }

    /// Matches `opcode` with an operand accepted by `test`.
    pub fn custom(opcode: OpCode, test: impl Fn(usize, &Operand) -> bool + Send + Sync + 'static) -> Self {
        Self::with(opcode, Predicate::custom(test))
    }

    /// Matches any encoding of `family`.
    #[must_use]
    pub fn family(family: SlotFamily) -> Self {
        Self::instruction(OpCodeMatcher::Family(family), Predicate::Any, CheckMode::Normal)
    }

    /// Matches any encoding of `family` with an operand satisfying `predicate`.
    #[must_use]
    pub fn family_with(family: SlotFamily, predicate: Predicate) -> Self {
        Self::instruction(OpCodeMatcher::Family(family), predicate, CheckMode::Normal)
    }

    /// Matches any encoding of `family` and binds the local variable it touches.
    #[must_use]
    pub fn variable(family: SlotFamily) -> Self {
        Self::instruction(OpCodeMatcher::Family(family), Predicate::Any, CheckMode::Variable)
    }

    /// Matches `opcode` and binds the local variable it touches.
    #[must_use]
    pub fn variable_opcode(opcode: OpCode) -> Self {
        Self::instruction(OpCodeMatcher::Exact(opcode), Predicate::Any, CheckMode::Variable)
    }

    /// Repeats the preceding instruction check `count` more times.
    #[must_use]
    pub fn repeat(count: usize) -> Self {
        Self::gap(CheckMode::Repeat(count))
    }

    /// Passes over `count` instructions.
    #[must_use]
    pub fn skip(count: usize) -> Self {
        Self::gap(CheckMode::Skip(count))
    }

    /// Passes over any number of instructions until the rest of the pattern matches.
    #[must_use]
    pub fn skip_indefinite() -> Self {
        Self::gap(CheckMode::SkipIndefinite)
    }

    /// Returns `true` if the instruction at `position` satisfies opcode and predicate.
    #[must_use]
    pub fn accepts(&self, position: usize, instruction: &Instruction) -> bool {
        self.opcode.matches(instruction.opcode) && self.predicate.matches(position, instruction)
    }
}

/// An ordered list of checks; reusable and free of matching state.
///
/// # Examples
///
/// ```rust
/// use cilpatch::assembly::{OpCode, SlotFamily};
/// use cilpatch::scanner::{OperandCheck, Pattern, Predicate};
///
/// let pattern = Pattern::new(vec![
///     OperandCheck::family(SlotFamily::Ldarg),
///     OperandCheck::with(OpCode::Ldfld, Predicate::FieldContains("::type".into())),
///     OperandCheck::skip_indefinite(),
///     OperandCheck::new(OpCode::Ret),
/// ]);
/// assert_eq!(pattern.len(), 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    checks: Vec<OperandCheck>,
}

impl Pattern {
    /// Creates a pattern from its checks.
    #[must_use]
    pub fn new(checks: Vec<OperandCheck>) -> Self {
        Pattern { checks }
    }

    /// A pattern matching `opcodes` in sequence, with any operands.
    #[must_use]
    pub fn from_opcodes(opcodes: &[OpCode]) -> Self {
        opcodes.iter().copied().map(OperandCheck::new).collect()
    }

    /// Appends a check.
    #[must_use]
    pub fn then(mut self, check: OperandCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// The checks, in order.
    #[must_use]
    pub fn checks(&self) -> &[OperandCheck] {
        &self.checks
    }

    /// Number of checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Returns `true` for a pattern without checks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl FromIterator<OperandCheck> for Pattern {
    fn from_iter<I: IntoIterator<Item = OperandCheck>>(iter: I) -> Self {
        Pattern::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        references::ResolutionScope,
        signatures::TypeSig,
    };

    fn item_type() -> FieldRef {
        FieldRef::new(TypeRef::new(ResolutionScope::Module, "Terraria", "Item"), "type", TypeSig::Int32)
    }

    #[test]
    fn test_no_operand_accepts_shorthand() {
        let check = OperandCheck::no_operand(OpCode::Ldarg0);
        assert!(check.accepts(0, &Instruction::load_argument(0)));
        assert!(!check.accepts(0, &Instruction::load_argument(5)));

        let check = OperandCheck::family_with(SlotFamily::Ldarg, Predicate::NoOperand);
        assert!(!check.accepts(0, &Instruction::load_argument(5)));
    }

    #[test]
    fn test_immediates_are_typed() {
        let check = OperandCheck::with(OpCode::LdcI4, Predicate::I4(200));
        assert!(check.accepts(0, &Instruction::new(OpCode::LdcI4, Operand::Immediate(Immediate::Int32(200)))));
        assert!(!check.accepts(0, &Instruction::new(OpCode::LdcI4, Operand::Immediate(Immediate::Int32(201)))));

        let short = OperandCheck::with(OpCode::LdcI4S, Predicate::I4(50));
        assert!(!short.accepts(0, &Instruction::load_int(50)));
        let short = OperandCheck::with(OpCode::LdcI4S, Predicate::I1(50));
        assert!(short.accepts(0, &Instruction::load_int(50)));
    }

    #[test]
    fn test_references_by_name() {
        let field = item_type();
        let load = Instruction::new(OpCode::Ldfld, Operand::Field(field.clone()));

        assert!(OperandCheck::with(OpCode::Ldfld, Predicate::field(&field)).accepts(0, &load));
        assert!(OperandCheck::with(OpCode::Ldfld, Predicate::FieldContains("Item::type".into()))
            .accepts(0, &load));
        assert!(!OperandCheck::with(OpCode::Ldfld, Predicate::MethodContains("Item".into()))
            .accepts(0, &load));
        assert!(!OperandCheck::with(OpCode::Stfld, Predicate::field(&field)).accepts(0, &load));
    }

    #[test]
    fn test_custom_sees_position() {
        let check = OperandCheck::custom(OpCode::Nop, |position, _| position == 2);
        assert!(!check.accepts(0, &Instruction::simple(OpCode::Nop)));
        assert!(check.accepts(2, &Instruction::simple(OpCode::Nop)));
        assert_eq!(format!("{:?}", check.predicate), "Custom(..)");
    }

    #[test]
    fn test_families() {
        let check = OperandCheck::family(SlotFamily::Stloc);
        assert!(check.accepts(0, &Instruction::store_local(0)));
        assert!(check.accepts(0, &Instruction::store_local(200)));
        assert!(check.accepts(0, &Instruction::store_local(1000)));
        assert!(!check.accepts(0, &Instruction::load_local(0)));
        assert!(CheckMode::SkipIndefinite.is_gap());
        assert!(!CheckMode::Variable.is_gap());
    }
}
