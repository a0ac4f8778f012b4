//! Editable CIL instructions.
//!
//! An [`Instruction`] pairs an [`OpCode`] with a resolved [`Operand`] and a stable
//! [`InstructionId`]. Branches and switches refer to their targets by id rather than by
//! offset or position, so inserting or removing code in front of a target never invalidates
//! the reference; offsets are only computed when a body is encoded.
//!
//! Shorthand loads and stores are normalized when decoded: `ldarg.1` carries
//! `Operand::Argument(1)` and `stloc.0` carries `Operand::Local(0)`, exactly like their
//! explicit `ldarg.s` / `stloc.s` counterparts. The opcode itself is kept as written, which is
//! what lets an unmodified body re-encode to identical bytes.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::assembly::{Instruction, OpCode, Operand};
//!
//! let load = Instruction::load_argument(0);
//! assert_eq!(load.opcode, OpCode::Ldarg0);
//! assert_eq!(load.operand, Operand::Argument(0));
//! assert!(load.id().is_detached());
//!
//! let wide = Instruction::load_local(300);
//! assert_eq!(wide.opcode, OpCode::Ldloc);
//! ```

use std::fmt::{self, UpperHex};

use crate::{
    assembly::opcodes::{FlowType, OpCode, OperandType, SlotFamily},
    metadata::{
        references::{FieldRef, MethodRef, TypeRef},
        signatures::{MethodSig, TypeSig},
    },
};

/// Stable identity of an instruction within one method body.
///
/// Ids are allocated by the owning [`crate::metadata::method::MethodBody`]. An instruction
/// that was built standalone carries the detached id until it is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstructionId(u32);

impl InstructionId {
    /// The id of an instruction not yet owned by a body.
    pub const DETACHED: InstructionId = InstructionId(0);

    pub(crate) const fn new(value: u32) -> Self {
        InstructionId(value)
    }

    /// The raw id value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns `true` for [`InstructionId::DETACHED`].
    #[must_use]
    pub const fn is_detached(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immediate constant embedded in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate value (`ldc.i4.s`)
    Int8(i8),
    /// Unsigned 8-bit immediate value (`unaligned.`, `no.`)
    UInt8(u8),
    /// Signed 32-bit immediate value
    Int32(i32),
    /// Signed 64-bit immediate value
    Int64(i64),
    /// 32-bit floating point immediate value
    Float32(f32),
    /// 64-bit floating point immediate value
    Float64(f64),
}

impl Immediate {
    /// The value as a signed integer, if it is one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Immediate::Int8(value) => Some(i64::from(value)),
            Immediate::UInt8(value) => Some(i64::from(value)),
            Immediate::Int32(value) => Some(i64::from(value)),
            Immediate::Int64(value) => Some(value),
            Immediate::Float32(_) | Immediate::Float64(_) => None,
        }
    }
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::UInt8(value) => write!(f, "{value:02X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::Float32(value) => write!(f, "{:08X}", value.to_bits()),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value}"),
            Immediate::UInt8(value) => write!(f, "{value}"),
            Immediate::Int32(value) => write!(f, "{value}"),
            Immediate::Int64(value) => write!(f, "{value}"),
            Immediate::Float32(value) => write!(f, "{value}"),
            Immediate::Float64(value) => write!(f, "{value}"),
        }
    }
}

/// A resolved instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Numeric constant
    Immediate(Immediate),
    /// User string (`ldstr`)
    String(String),
    /// Argument slot; slot 0 is `this` for instance methods
    Argument(u16),
    /// Local variable slot
    Local(u16),
    /// Field reference
    Field(FieldRef),
    /// Method reference
    Method(MethodRef),
    /// Type reference
    Type(TypeRef),
    /// Constructed type (`TypeSpec`): arrays, generic instances, pointers
    TypeSig(TypeSig),
    /// Call site signature (`calli`)
    CallSite(MethodSig),
    /// Branch target
    Target(InstructionId),
    /// Jump table
    Switch(Vec<InstructionId>),
}

impl Operand {
    /// The local variable slot, if this operand names one.
    #[must_use]
    pub fn local(&self) -> Option<u16> {
        match self {
            Operand::Local(index) => Some(*index),
            _ => None,
        }
    }

    /// The argument slot, if this operand names one.
    #[must_use]
    pub fn argument(&self) -> Option<u16> {
        match self {
            Operand::Argument(index) => Some(*index),
            _ => None,
        }
    }

    /// The referenced field, if any.
    #[must_use]
    pub fn field(&self) -> Option<&FieldRef> {
        match self {
            Operand::Field(field) => Some(field),
            _ => None,
        }
    }

    /// The referenced method, if any.
    #[must_use]
    pub fn method(&self) -> Option<&MethodRef> {
        match self {
            Operand::Method(method) => Some(method),
            _ => None,
        }
    }

    /// The referenced type, if any.
    #[must_use]
    pub fn type_ref(&self) -> Option<&TypeRef> {
        match self {
            Operand::Type(reference) => Some(reference),
            _ => None,
        }
    }

    /// The immediate value as a signed integer, if there is one.
    #[must_use]
    pub fn int_value(&self) -> Option<i64> {
        match self {
            Operand::Immediate(immediate) => immediate.as_i64(),
            _ => None,
        }
    }

    /// Every instruction id this operand refers to.
    #[must_use]
    pub fn targets(&self) -> &[InstructionId] {
        match self {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Switch(targets) => targets,
            _ => &[],
        }
    }

    /// Returns `true` if this operand is a legal operand for `opcode`.
    #[must_use]
    pub fn fits(&self, opcode: OpCode) -> bool {
        match (opcode.operand_type(), self) {
            (OperandType::InlineNone, Operand::None) => opcode.implicit_slot().is_none(),
            (OperandType::InlineNone, Operand::Argument(index)) => {
                opcode.family() == Some(SlotFamily::Ldarg) && opcode.implicit_slot() == Some(*index)
            }
            (OperandType::InlineNone, Operand::Local(index)) => {
                opcode.family().is_some_and(SlotFamily::is_local)
                    && opcode.implicit_slot() == Some(*index)
            }
            (OperandType::ShortInlineI, Operand::Immediate(Immediate::Int8(_)))
            | (OperandType::ShortInlineU, Operand::Immediate(Immediate::UInt8(_)))
            | (OperandType::InlineI, Operand::Immediate(Immediate::Int32(_)))
            | (OperandType::InlineI8, Operand::Immediate(Immediate::Int64(_)))
            | (OperandType::ShortInlineR, Operand::Immediate(Immediate::Float32(_)))
            | (OperandType::InlineR, Operand::Immediate(Immediate::Float64(_)))
            | (OperandType::InlineString, Operand::String(_))
            | (OperandType::InlineField, Operand::Field(_))
            | (OperandType::InlineMethod, Operand::Method(_))
            | (OperandType::InlineType, Operand::Type(_) | Operand::TypeSig(_))
            | (
                OperandType::InlineTok,
                Operand::Field(_) | Operand::Method(_) | Operand::Type(_) | Operand::TypeSig(_),
            )
            | (OperandType::InlineSig, Operand::CallSite(_))
            | (OperandType::ShortInlineBrTarget | OperandType::InlineBrTarget, Operand::Target(_))
            | (OperandType::InlineSwitch, Operand::Switch(_))
            | (OperandType::InlineVar, Operand::Local(_))
            | (OperandType::InlineArg, Operand::Argument(_)) => true,
            (OperandType::ShortInlineVar, Operand::Local(index))
            | (OperandType::ShortInlineArg, Operand::Argument(index)) => *index <= u16::from(u8::MAX),
            _ => false,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Immediate(immediate) => write!(f, "{immediate}"),
            Operand::String(value) => write!(f, "{value:?}"),
            Operand::Argument(index) => write!(f, "A_{index}"),
            Operand::Local(index) => write!(f, "V_{index}"),
            Operand::Field(field) => write!(f, "{field}"),
            Operand::Method(method) => write!(f, "{method}"),
            Operand::Type(reference) => write!(f, "{}", reference.full_name()),
            Operand::TypeSig(signature) => write!(f, "{signature}"),
            Operand::CallSite(sig) => write!(f, "{}{}", sig.return_type, sig.parameter_list()),
            Operand::Target(target) => write!(f, "{target}"),
            Operand::Switch(targets) => {
                let labels: Vec<String> = targets.iter().map(ToString::to_string).collect();
                write!(f, "({})", labels.join(", "))
            }
        }
    }
}

/// One CIL instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    id: InstructionId,
    /// The opcode
    pub opcode: OpCode,
    /// The resolved operand
    pub operand: Operand,
}

impl Instruction {
    /// Creates a detached instruction.
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Instruction {
            id: InstructionId::DETACHED,
            opcode,
            operand,
        }
    }

    /// Creates a detached instruction without an operand.
    #[must_use]
    pub fn simple(opcode: OpCode) -> Self {
        Instruction::new(opcode, Operand::None)
    }

    /// `call method`
    #[must_use]
    pub fn call(method: MethodRef) -> Self {
        Instruction::new(OpCode::Call, Operand::Method(method))
    }

    /// Loads an argument using the shortest encoding.
    #[must_use]
    pub fn load_argument(index: u16) -> Self {
        let opcode = match index {
            0 => OpCode::Ldarg0,
            1 => OpCode::Ldarg1,
            2 => OpCode::Ldarg2,
            3 => OpCode::Ldarg3,
            4..=255 => OpCode::LdargS,
            _ => OpCode::Ldarg,
        };
        Instruction::new(opcode, Operand::Argument(index))
    }

    /// Loads a local variable using the shortest encoding.
    #[must_use]
    pub fn load_local(index: u16) -> Self {
        let opcode = match index {
            0 => OpCode::Ldloc0,
            1 => OpCode::Ldloc1,
            2 => OpCode::Ldloc2,
            3 => OpCode::Ldloc3,
            4..=255 => OpCode::LdlocS,
            _ => OpCode::Ldloc,
        };
        Instruction::new(opcode, Operand::Local(index))
    }

    /// Stores to a local variable using the shortest encoding.
    #[must_use]
    pub fn store_local(index: u16) -> Self {
        let opcode = match index {
            0 => OpCode::Stloc0,
            1 => OpCode::Stloc1,
            2 => OpCode::Stloc2,
            3 => OpCode::Stloc3,
            4..=255 => OpCode::StlocS,
            _ => OpCode::Stloc,
        };
        Instruction::new(opcode, Operand::Local(index))
    }

    /// Loads a 32-bit constant using the shortest encoding.
    #[must_use]
    pub fn load_int(value: i32) -> Self {
        let opcode = match value {
            -1 => OpCode::LdcI4M1,
            0 => OpCode::LdcI40,
            1 => OpCode::LdcI41,
            2 => OpCode::LdcI42,
            3 => OpCode::LdcI43,
            4 => OpCode::LdcI44,
            5 => OpCode::LdcI45,
            6 => OpCode::LdcI46,
            7 => OpCode::LdcI47,
            8 => OpCode::LdcI48,
            _ => {
                return match i8::try_from(value) {
                    Ok(short) => Instruction::new(OpCode::LdcI4S, Operand::Immediate(Immediate::Int8(short))),
                    Err(_) => Instruction::new(OpCode::LdcI4, Operand::Immediate(Immediate::Int32(value))),
                }
            }
        };
        Instruction::simple(opcode)
    }

    /// The instruction's identity within its body.
    #[must_use]
    pub fn id(&self) -> InstructionId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: InstructionId) {
        self.id = id;
    }

    /// Control-flow behaviour of the opcode.
    #[must_use]
    pub fn flow(&self) -> FlowType {
        self.opcode.flow()
    }

    /// Returns `true` for branches, leaves and switches.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.opcode.is_branch()
    }

    /// The local variable this instruction loads, stores or addresses.
    #[must_use]
    pub fn local(&self) -> Option<u16> {
        self.operand.local()
    }

    /// Compares opcode and operand, ignoring identity.
    #[must_use]
    pub fn same_code(&self, other: &Instruction) -> bool {
        self.opcode == other.opcode && self.operand == other.operand
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.opcode.implicit_slot().is_some() || matches!(self.operand, Operand::None) {
            write!(f, "{}", self.opcode)
        } else {
            write!(f, "{} {}", self.opcode, self.operand)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortest_forms() {
        assert_eq!(Instruction::load_argument(2).opcode, OpCode::Ldarg2);
        assert_eq!(Instruction::load_argument(9).opcode, OpCode::LdargS);
        assert_eq!(Instruction::load_local(256).opcode, OpCode::Ldloc);
        assert_eq!(Instruction::store_local(3).opcode, OpCode::Stloc3);
        assert_eq!(Instruction::load_int(-1).opcode, OpCode::LdcI4M1);
        assert_eq!(Instruction::load_int(100).operand, Operand::Immediate(Immediate::Int8(100)));
        assert_eq!(Instruction::load_int(1000).opcode, OpCode::LdcI4);
    }

    #[test]
    fn test_operand_fits() {
        assert!(Operand::Argument(0).fits(OpCode::Ldarg0));
        assert!(!Operand::Argument(1).fits(OpCode::Ldarg0));
        assert!(!Operand::None.fits(OpCode::Ldarg0));
        assert!(Operand::Local(2).fits(OpCode::Stloc2));
        assert!(!Operand::Local(2).fits(OpCode::Ldarg2));
        assert!(Operand::None.fits(OpCode::Ret));
        assert!(!Operand::Local(300).fits(OpCode::LdlocS));
        assert!(Operand::Local(300).fits(OpCode::Ldloc));
        assert!(Operand::Target(InstructionId::new(4)).fits(OpCode::BrS));
        assert!(!Operand::Immediate(Immediate::Int32(1)).fits(OpCode::LdcI4S));

        let array = Operand::TypeSig(TypeSig::SzArray(Box::new(TypeSig::Int32)));
        assert!(array.fits(OpCode::Newarr));
        assert!(array.fits(OpCode::Ldtoken));
        assert!(!array.fits(OpCode::Call));
        assert_eq!(array.to_string(), "System.Int32[]");
    }

    #[test]
    fn test_display() {
        assert_eq!(Instruction::load_local(1).to_string(), "ldloc.1");
        assert_eq!(Instruction::load_local(7).to_string(), "ldloc.s V_7");
        assert_eq!(
            Instruction::new(OpCode::Ldstr, Operand::String("hi".into())).to_string(),
            "ldstr \"hi\""
        );
        assert_eq!(format!("{:X}", Immediate::Int32(255)), "000000FF");
    }

    #[test]
    fn test_targets() {
        let switch = Operand::Switch(vec![InstructionId::new(2), InstructionId::new(5)]);
        assert_eq!(switch.targets().len(), 2);
        assert!(Operand::None.targets().is_empty());
    }
}
