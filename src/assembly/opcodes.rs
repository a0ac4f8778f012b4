//! The CIL opcode table (ECMA-335 Partition III).
//!
//! [`OpCode`] enumerates every instruction of the base instruction set. Each variant carries
//! its encoding (an optional `0xFE` prefix plus one byte), its mnemonic, the kind of inline
//! operand it takes ([`OperandType`]) and its control-flow behaviour ([`FlowType`]). The table
//! is generated from a single list so the encoder, decoder and mnemonic parser cannot drift
//! apart.
//!
//! Shorthand forms that encode a slot index in the opcode itself (`ldarg.0`, `ldloc.2`,
//! `stloc.3`, ...) report that index through [`OpCode::implicit_slot`], and every load/store
//! opcode belongs to a [`SlotFamily`] regardless of its encoding width.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::assembly::{OpCode, SlotFamily, FlowType};
//! use std::str::FromStr;
//!
//! let op = OpCode::from_str("ldloc.1")?;
//! assert_eq!(op, OpCode::Ldloc1);
//! assert_eq!(op.family(), Some(SlotFamily::Ldloc));
//! assert_eq!(OpCode::BrS.flow(), FlowType::UnconditionalBranch);
//! assert_eq!(OpCode::decode(0xFE, 0x01), Some(OpCode::Ceq));
//! # Ok::<(), strum::ParseError>(())
//! ```

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// The inline operand kinds of the CIL instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    InlineNone,
    /// Signed 8-bit integer
    ShortInlineI,
    /// Unsigned 8-bit integer (`unaligned.`, `no.`)
    ShortInlineU,
    /// Signed 32-bit integer
    InlineI,
    /// Signed 64-bit integer
    InlineI8,
    /// 32-bit float
    ShortInlineR,
    /// 64-bit float
    InlineR,
    /// User string token
    InlineString,
    /// Field token
    InlineField,
    /// Method token
    InlineMethod,
    /// Type token
    InlineType,
    /// Field, method or type token (`ldtoken`)
    InlineTok,
    /// Stand-alone signature token (`calli`)
    InlineSig,
    /// 8-bit relative branch target
    ShortInlineBrTarget,
    /// 32-bit relative branch target
    InlineBrTarget,
    /// Jump table
    InlineSwitch,
    /// 8-bit local variable index
    ShortInlineVar,
    /// 16-bit local variable index
    InlineVar,
    /// 8-bit argument index
    ShortInlineArg,
    /// 16-bit argument index
    InlineArg,
}

impl OperandType {
    /// Size in bytes of the inline operand, or `None` for the variable-size switch table.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::InlineNone => Some(0),
            OperandType::ShortInlineI
            | OperandType::ShortInlineU
            | OperandType::ShortInlineBrTarget
            | OperandType::ShortInlineVar
            | OperandType::ShortInlineArg => Some(1),
            OperandType::InlineVar | OperandType::InlineArg => Some(2),
            OperandType::InlineI
            | OperandType::ShortInlineR
            | OperandType::InlineString
            | OperandType::InlineField
            | OperandType::InlineMethod
            | OperandType::InlineType
            | OperandType::InlineTok
            | OperandType::InlineSig
            | OperandType::InlineBrTarget => Some(4),
            OperandType::InlineI8 | OperandType::InlineR => Some(8),
            OperandType::InlineSwitch => None,
        }
    }

    /// Returns `true` for operands encoded as a metadata token.
    #[must_use]
    pub const fn is_token(&self) -> bool {
        matches!(
            self,
            OperandType::InlineString
                | OperandType::InlineField
                | OperandType::InlineMethod
                | OperandType::InlineType
                | OperandType::InlineTok
                | OperandType::InlineSig
        )
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// End of finally or filter block
    EndFinally,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// Groups of load/store opcodes that address the same kind of slot.
///
/// A family matches the shorthand, short and long encodings alike, so a pattern written
/// against `Ldloc` accepts `ldloc.0`, `ldloc.s 7` and `ldloc 300`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotFamily {
    /// `ldarg.0-3`, `ldarg.s`, `ldarg`
    Ldarg,
    /// `ldarga.s`, `ldarga`
    Ldarga,
    /// `starg.s`, `starg`
    Starg,
    /// `ldloc.0-3`, `ldloc.s`, `ldloc`
    Ldloc,
    /// `ldloca.s`, `ldloca`
    Ldloca,
    /// `stloc.0-3`, `stloc.s`, `stloc`
    Stloc,
}

impl SlotFamily {
    /// Returns `true` if `opcode` belongs to this family.
    #[must_use]
    pub fn matches(self, opcode: OpCode) -> bool {
        opcode.family() == Some(self)
    }

    /// Returns `true` for families addressing local variables.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, SlotFamily::Ldloc | SlotFamily::Ldloca | SlotFamily::Stloc)
    }
}

/// Static facts about one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCodeInfo {
    /// `0xFE` for two-byte opcodes, `0` otherwise
    pub prefix: u8,
    /// The opcode byte (second byte for two-byte opcodes)
    pub code: u8,
    /// The ILAsm mnemonic
    pub mnemonic: &'static str,
    /// The inline operand kind
    pub operand_type: OperandType,
    /// Control-flow behaviour
    pub flow: FlowType,
}

macro_rules! define_opcodes {
    ($( $variant:ident => ($prefix:literal, $code:literal, $mnemonic:literal, $operand:ident, $flow:ident) ),* $(,)?) => {
        /// A CIL opcode.
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr)]
        pub enum OpCode {
            $(
                #[strum(serialize = $mnemonic)]
                $variant,
            )*
        }

        impl OpCode {
            /// Static facts about this opcode.
            #[must_use]
            pub const fn info(self) -> OpCodeInfo {
                match self {
                    $(
                        OpCode::$variant => OpCodeInfo {
                            prefix: $prefix,
                            code: $code,
                            mnemonic: $mnemonic,
                            operand_type: OperandType::$operand,
                            flow: FlowType::$flow,
                        },
                    )*
                }
            }

            /// Looks up an opcode by its encoding. Use `prefix = 0` for single-byte opcodes.
            #[must_use]
            pub const fn decode(prefix: u8, code: u8) -> Option<OpCode> {
                match (prefix, code) {
                    $( ($prefix, $code) => Some(OpCode::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

define_opcodes! {
    Nop => (0x00, 0x00, "nop", InlineNone, Sequential),
    Break => (0x00, 0x01, "break", InlineNone, Sequential),
    Ldarg0 => (0x00, 0x02, "ldarg.0", InlineNone, Sequential),
    Ldarg1 => (0x00, 0x03, "ldarg.1", InlineNone, Sequential),
    Ldarg2 => (0x00, 0x04, "ldarg.2", InlineNone, Sequential),
    Ldarg3 => (0x00, 0x05, "ldarg.3", InlineNone, Sequential),
    Ldloc0 => (0x00, 0x06, "ldloc.0", InlineNone, Sequential),
    Ldloc1 => (0x00, 0x07, "ldloc.1", InlineNone, Sequential),
    Ldloc2 => (0x00, 0x08, "ldloc.2", InlineNone, Sequential),
    Ldloc3 => (0x00, 0x09, "ldloc.3", InlineNone, Sequential),
    Stloc0 => (0x00, 0x0A, "stloc.0", InlineNone, Sequential),
    Stloc1 => (0x00, 0x0B, "stloc.1", InlineNone, Sequential),
    Stloc2 => (0x00, 0x0C, "stloc.2", InlineNone, Sequential),
    Stloc3 => (0x00, 0x0D, "stloc.3", InlineNone, Sequential),
    LdargS => (0x00, 0x0E, "ldarg.s", ShortInlineArg, Sequential),
    LdargaS => (0x00, 0x0F, "ldarga.s", ShortInlineArg, Sequential),
    StargS => (0x00, 0x10, "starg.s", ShortInlineArg, Sequential),
    LdlocS => (0x00, 0x11, "ldloc.s", ShortInlineVar, Sequential),
    LdlocaS => (0x00, 0x12, "ldloca.s", ShortInlineVar, Sequential),
    StlocS => (0x00, 0x13, "stloc.s", ShortInlineVar, Sequential),
    Ldnull => (0x00, 0x14, "ldnull", InlineNone, Sequential),
    LdcI4M1 => (0x00, 0x15, "ldc.i4.m1", InlineNone, Sequential),
    LdcI40 => (0x00, 0x16, "ldc.i4.0", InlineNone, Sequential),
    LdcI41 => (0x00, 0x17, "ldc.i4.1", InlineNone, Sequential),
    LdcI42 => (0x00, 0x18, "ldc.i4.2", InlineNone, Sequential),
    LdcI43 => (0x00, 0x19, "ldc.i4.3", InlineNone, Sequential),
    LdcI44 => (0x00, 0x1A, "ldc.i4.4", InlineNone, Sequential),
    LdcI45 => (0x00, 0x1B, "ldc.i4.5", InlineNone, Sequential),
    LdcI46 => (0x00, 0x1C, "ldc.i4.6", InlineNone, Sequential),
    LdcI47 => (0x00, 0x1D, "ldc.i4.7", InlineNone, Sequential),
    LdcI48 => (0x00, 0x1E, "ldc.i4.8", InlineNone, Sequential),
    LdcI4S => (0x00, 0x1F, "ldc.i4.s", ShortInlineI, Sequential),
    LdcI4 => (0x00, 0x20, "ldc.i4", InlineI, Sequential),
    LdcI8 => (0x00, 0x21, "ldc.i8", InlineI8, Sequential),
    LdcR4 => (0x00, 0x22, "ldc.r4", ShortInlineR, Sequential),
    LdcR8 => (0x00, 0x23, "ldc.r8", InlineR, Sequential),
    Dup => (0x00, 0x25, "dup", InlineNone, Sequential),
    Pop => (0x00, 0x26, "pop", InlineNone, Sequential),
    Jmp => (0x00, 0x27, "jmp", InlineMethod, Call),
    Call => (0x00, 0x28, "call", InlineMethod, Call),
    Calli => (0x00, 0x29, "calli", InlineSig, Call),
    Ret => (0x00, 0x2A, "ret", InlineNone, Return),
    BrS => (0x00, 0x2B, "br.s", ShortInlineBrTarget, UnconditionalBranch),
    BrfalseS => (0x00, 0x2C, "brfalse.s", ShortInlineBrTarget, ConditionalBranch),
    BrtrueS => (0x00, 0x2D, "brtrue.s", ShortInlineBrTarget, ConditionalBranch),
    BeqS => (0x00, 0x2E, "beq.s", ShortInlineBrTarget, ConditionalBranch),
    BgeS => (0x00, 0x2F, "bge.s", ShortInlineBrTarget, ConditionalBranch),
    BgtS => (0x00, 0x30, "bgt.s", ShortInlineBrTarget, ConditionalBranch),
    BleS => (0x00, 0x31, "ble.s", ShortInlineBrTarget, ConditionalBranch),
    BltS => (0x00, 0x32, "blt.s", ShortInlineBrTarget, ConditionalBranch),
    BneUnS => (0x00, 0x33, "bne.un.s", ShortInlineBrTarget, ConditionalBranch),
    BgeUnS => (0x00, 0x34, "bge.un.s", ShortInlineBrTarget, ConditionalBranch),
    BgtUnS => (0x00, 0x35, "bgt.un.s", ShortInlineBrTarget, ConditionalBranch),
    BleUnS => (0x00, 0x36, "ble.un.s", ShortInlineBrTarget, ConditionalBranch),
    BltUnS => (0x00, 0x37, "blt.un.s", ShortInlineBrTarget, ConditionalBranch),
    Br => (0x00, 0x38, "br", InlineBrTarget, UnconditionalBranch),
    Brfalse => (0x00, 0x39, "brfalse", InlineBrTarget, ConditionalBranch),
    Brtrue => (0x00, 0x3A, "brtrue", InlineBrTarget, ConditionalBranch),
    Beq => (0x00, 0x3B, "beq", InlineBrTarget, ConditionalBranch),
    Bge => (0x00, 0x3C, "bge", InlineBrTarget, ConditionalBranch),
    Bgt => (0x00, 0x3D, "bgt", InlineBrTarget, ConditionalBranch),
    Ble => (0x00, 0x3E, "ble", InlineBrTarget, ConditionalBranch),
    Blt => (0x00, 0x3F, "blt", InlineBrTarget, ConditionalBranch),
    BneUn => (0x00, 0x40, "bne.un", InlineBrTarget, ConditionalBranch),
    BgeUn => (0x00, 0x41, "bge.un", InlineBrTarget, ConditionalBranch),
    BgtUn => (0x00, 0x42, "bgt.un", InlineBrTarget, ConditionalBranch),
    BleUn => (0x00, 0x43, "ble.un", InlineBrTarget, ConditionalBranch),
    BltUn => (0x00, 0x44, "blt.un", InlineBrTarget, ConditionalBranch),
    Switch => (0x00, 0x45, "switch", InlineSwitch, Switch),
    LdindI1 => (0x00, 0x46, "ldind.i1", InlineNone, Sequential),
    LdindU1 => (0x00, 0x47, "ldind.u1", InlineNone, Sequential),
    LdindI2 => (0x00, 0x48, "ldind.i2", InlineNone, Sequential),
    LdindU2 => (0x00, 0x49, "ldind.u2", InlineNone, Sequential),
    LdindI4 => (0x00, 0x4A, "ldind.i4", InlineNone, Sequential),
    LdindU4 => (0x00, 0x4B, "ldind.u4", InlineNone, Sequential),
    LdindI8 => (0x00, 0x4C, "ldind.i8", InlineNone, Sequential),
    LdindI => (0x00, 0x4D, "ldind.i", InlineNone, Sequential),
    LdindR4 => (0x00, 0x4E, "ldind.r4", InlineNone, Sequential),
    LdindR8 => (0x00, 0x4F, "ldind.r8", InlineNone, Sequential),
    LdindRef => (0x00, 0x50, "ldind.ref", InlineNone, Sequential),
    StindRef => (0x00, 0x51, "stind.ref", InlineNone, Sequential),
    StindI1 => (0x00, 0x52, "stind.i1", InlineNone, Sequential),
    StindI2 => (0x00, 0x53, "stind.i2", InlineNone, Sequential),
    StindI4 => (0x00, 0x54, "stind.i4", InlineNone, Sequential),
    StindI8 => (0x00, 0x55, "stind.i8", InlineNone, Sequential),
    StindR4 => (0x00, 0x56, "stind.r4", InlineNone, Sequential),
    StindR8 => (0x00, 0x57, "stind.r8", InlineNone, Sequential),
    Add => (0x00, 0x58, "add", InlineNone, Sequential),
    Sub => (0x00, 0x59, "sub", InlineNone, Sequential),
    Mul => (0x00, 0x5A, "mul", InlineNone, Sequential),
    Div => (0x00, 0x5B, "div", InlineNone, Sequential),
    DivUn => (0x00, 0x5C, "div.un", InlineNone, Sequential),
    Rem => (0x00, 0x5D, "rem", InlineNone, Sequential),
    RemUn => (0x00, 0x5E, "rem.un", InlineNone, Sequential),
    And => (0x00, 0x5F, "and", InlineNone, Sequential),
    Or => (0x00, 0x60, "or", InlineNone, Sequential),
    Xor => (0x00, 0x61, "xor", InlineNone, Sequential),
    Shl => (0x00, 0x62, "shl", InlineNone, Sequential),
    Shr => (0x00, 0x63, "shr", InlineNone, Sequential),
    ShrUn => (0x00, 0x64, "shr.un", InlineNone, Sequential),
    Neg => (0x00, 0x65, "neg", InlineNone, Sequential),
    Not => (0x00, 0x66, "not", InlineNone, Sequential),
    ConvI1 => (0x00, 0x67, "conv.i1", InlineNone, Sequential),
    ConvI2 => (0x00, 0x68, "conv.i2", InlineNone, Sequential),
    ConvI4 => (0x00, 0x69, "conv.i4", InlineNone, Sequential),
    ConvI8 => (0x00, 0x6A, "conv.i8", InlineNone, Sequential),
    ConvR4 => (0x00, 0x6B, "conv.r4", InlineNone, Sequential),
    ConvR8 => (0x00, 0x6C, "conv.r8", InlineNone, Sequential),
    ConvU4 => (0x00, 0x6D, "conv.u4", InlineNone, Sequential),
    ConvU8 => (0x00, 0x6E, "conv.u8", InlineNone, Sequential),
    Callvirt => (0x00, 0x6F, "callvirt", InlineMethod, Call),
    Cpobj => (0x00, 0x70, "cpobj", InlineType, Sequential),
    Ldobj => (0x00, 0x71, "ldobj", InlineType, Sequential),
    Ldstr => (0x00, 0x72, "ldstr", InlineString, Sequential),
    Newobj => (0x00, 0x73, "newobj", InlineMethod, Call),
    Castclass => (0x00, 0x74, "castclass", InlineType, Sequential),
    Isinst => (0x00, 0x75, "isinst", InlineType, Sequential),
    ConvRUn => (0x00, 0x76, "conv.r.un", InlineNone, Sequential),
    Unbox => (0x00, 0x79, "unbox", InlineType, Sequential),
    Throw => (0x00, 0x7A, "throw", InlineNone, Throw),
    Ldfld => (0x00, 0x7B, "ldfld", InlineField, Sequential),
    Ldflda => (0x00, 0x7C, "ldflda", InlineField, Sequential),
    Stfld => (0x00, 0x7D, "stfld", InlineField, Sequential),
    Ldsfld => (0x00, 0x7E, "ldsfld", InlineField, Sequential),
    Ldsflda => (0x00, 0x7F, "ldsflda", InlineField, Sequential),
    Stsfld => (0x00, 0x80, "stsfld", InlineField, Sequential),
    Stobj => (0x00, 0x81, "stobj", InlineType, Sequential),
    ConvOvfI1Un => (0x00, 0x82, "conv.ovf.i1.un", InlineNone, Sequential),
    ConvOvfI2Un => (0x00, 0x83, "conv.ovf.i2.un", InlineNone, Sequential),
    ConvOvfI4Un => (0x00, 0x84, "conv.ovf.i4.un", InlineNone, Sequential),
    ConvOvfI8Un => (0x00, 0x85, "conv.ovf.i8.un", InlineNone, Sequential),
    ConvOvfU1Un => (0x00, 0x86, "conv.ovf.u1.un", InlineNone, Sequential),
    ConvOvfU2Un => (0x00, 0x87, "conv.ovf.u2.un", InlineNone, Sequential),
    ConvOvfU4Un => (0x00, 0x88, "conv.ovf.u4.un", InlineNone, Sequential),
    ConvOvfU8Un => (0x00, 0x89, "conv.ovf.u8.un", InlineNone, Sequential),
    ConvOvfIUn => (0x00, 0x8A, "conv.ovf.i.un", InlineNone, Sequential),
    ConvOvfUUn => (0x00, 0x8B, "conv.ovf.u.un", InlineNone, Sequential),
    Box => (0x00, 0x8C, "box", InlineType, Sequential),
    Newarr => (0x00, 0x8D, "newarr", InlineType, Sequential),
    Ldlen => (0x00, 0x8E, "ldlen", InlineNone, Sequential),
    Ldelema => (0x00, 0x8F, "ldelema", InlineType, Sequential),
    LdelemI1 => (0x00, 0x90, "ldelem.i1", InlineNone, Sequential),
    LdelemU1 => (0x00, 0x91, "ldelem.u1", InlineNone, Sequential),
    LdelemI2 => (0x00, 0x92, "ldelem.i2", InlineNone, Sequential),
    LdelemU2 => (0x00, 0x93, "ldelem.u2", InlineNone, Sequential),
    LdelemI4 => (0x00, 0x94, "ldelem.i4", InlineNone, Sequential),
    LdelemU4 => (0x00, 0x95, "ldelem.u4", InlineNone, Sequential),
    LdelemI8 => (0x00, 0x96, "ldelem.i8", InlineNone, Sequential),
    LdelemI => (0x00, 0x97, "ldelem.i", InlineNone, Sequential),
    LdelemR4 => (0x00, 0x98, "ldelem.r4", InlineNone, Sequential),
    LdelemR8 => (0x00, 0x99, "ldelem.r8", InlineNone, Sequential),
    LdelemRef => (0x00, 0x9A, "ldelem.ref", InlineNone, Sequential),
    StelemI => (0x00, 0x9B, "stelem.i", InlineNone, Sequential),
    StelemI1 => (0x00, 0x9C, "stelem.i1", InlineNone, Sequential),
    StelemI2 => (0x00, 0x9D, "stelem.i2", InlineNone, Sequential),
    StelemI4 => (0x00, 0x9E, "stelem.i4", InlineNone, Sequential),
    StelemI8 => (0x00, 0x9F, "stelem.i8", InlineNone, Sequential),
    StelemR4 => (0x00, 0xA0, "stelem.r4", InlineNone, Sequential),
    StelemR8 => (0x00, 0xA1, "stelem.r8", InlineNone, Sequential),
    StelemRef => (0x00, 0xA2, "stelem.ref", InlineNone, Sequential),
    Ldelem => (0x00, 0xA3, "ldelem", InlineType, Sequential),
    Stelem => (0x00, 0xA4, "stelem", InlineType, Sequential),
    UnboxAny => (0x00, 0xA5, "unbox.any", InlineType, Sequential),
    ConvOvfI1 => (0x00, 0xB3, "conv.ovf.i1", InlineNone, Sequential),
    ConvOvfU1 => (0x00, 0xB4, "conv.ovf.u1", InlineNone, Sequential),
    ConvOvfI2 => (0x00, 0xB5, "conv.ovf.i2", InlineNone, Sequential),
    ConvOvfU2 => (0x00, 0xB6, "conv.ovf.u2", InlineNone, Sequential),
    ConvOvfI4 => (0x00, 0xB7, "conv.ovf.i4", InlineNone, Sequential),
    ConvOvfU4 => (0x00, 0xB8, "conv.ovf.u4", InlineNone, Sequential),
    ConvOvfI8 => (0x00, 0xB9, "conv.ovf.i8", InlineNone, Sequential),
    ConvOvfU8 => (0x00, 0xBA, "conv.ovf.u8", InlineNone, Sequential),
    Refanyval => (0x00, 0xC2, "refanyval", InlineType, Sequential),
    Ckfinite => (0x00, 0xC3, "ckfinite", InlineNone, Sequential),
    Mkrefany => (0x00, 0xC6, "mkrefany", InlineType, Sequential),
    Ldtoken => (0x00, 0xD0, "ldtoken", InlineTok, Sequential),
    ConvU2 => (0x00, 0xD1, "conv.u2", InlineNone, Sequential),
    ConvU1 => (0x00, 0xD2, "conv.u1", InlineNone, Sequential),
    ConvI => (0x00, 0xD3, "conv.i", InlineNone, Sequential),
    ConvOvfI => (0x00, 0xD4, "conv.ovf.i", InlineNone, Sequential),
    ConvOvfU => (0x00, 0xD5, "conv.ovf.u", InlineNone, Sequential),
    AddOvf => (0x00, 0xD6, "add.ovf", InlineNone, Sequential),
    AddOvfUn => (0x00, 0xD7, "add.ovf.un", InlineNone, Sequential),
    MulOvf => (0x00, 0xD8, "mul.ovf", InlineNone, Sequential),
    MulOvfUn => (0x00, 0xD9, "mul.ovf.un", InlineNone, Sequential),
    SubOvf => (0x00, 0xDA, "sub.ovf", InlineNone, Sequential),
    SubOvfUn => (0x00, 0xDB, "sub.ovf.un", InlineNone, Sequential),
    Endfinally => (0x00, 0xDC, "endfinally", InlineNone, EndFinally),
    Leave => (0x00, 0xDD, "leave", InlineBrTarget, Leave),
    LeaveS => (0x00, 0xDE, "leave.s", ShortInlineBrTarget, Leave),
    StindI => (0x00, 0xDF, "stind.i", InlineNone, Sequential),
    ConvU => (0x00, 0xE0, "conv.u", InlineNone, Sequential),
    Arglist => (0xFE, 0x00, "arglist", InlineNone, Sequential),
    Ceq => (0xFE, 0x01, "ceq", InlineNone, Sequential),
    Cgt => (0xFE, 0x02, "cgt", InlineNone, Sequential),
    CgtUn => (0xFE, 0x03, "cgt.un", InlineNone, Sequential),
    Clt => (0xFE, 0x04, "clt", InlineNone, Sequential),
    CltUn => (0xFE, 0x05, "clt.un", InlineNone, Sequential),
    Ldftn => (0xFE, 0x06, "ldftn", InlineMethod, Sequential),
    Ldvirtftn => (0xFE, 0x07, "ldvirtftn", InlineMethod, Sequential),
    Ldarg => (0xFE, 0x09, "ldarg", InlineArg, Sequential),
    Ldarga => (0xFE, 0x0A, "ldarga", InlineArg, Sequential),
    Starg => (0xFE, 0x0B, "starg", InlineArg, Sequential),
    Ldloc => (0xFE, 0x0C, "ldloc", InlineVar, Sequential),
    Ldloca => (0xFE, 0x0D, "ldloca", InlineVar, Sequential),
    Stloc => (0xFE, 0x0E, "stloc", InlineVar, Sequential),
    Localloc => (0xFE, 0x0F, "localloc", InlineNone, Sequential),
    Endfilter => (0xFE, 0x11, "endfilter", InlineNone, EndFinally),
    Unaligned => (0xFE, 0x12, "unaligned.", ShortInlineU, Sequential),
    Volatile => (0xFE, 0x13, "volatile.", InlineNone, Sequential),
    Tail => (0xFE, 0x14, "tail.", InlineNone, Sequential),
    Initobj => (0xFE, 0x15, "initobj", InlineType, Sequential),
    Constrained => (0xFE, 0x16, "constrained.", InlineType, Sequential),
    Cpblk => (0xFE, 0x17, "cpblk", InlineNone, Sequential),
    Initblk => (0xFE, 0x18, "initblk", InlineNone, Sequential),
    No => (0xFE, 0x19, "no.", ShortInlineU, Sequential),
    Rethrow => (0xFE, 0x1A, "rethrow", InlineNone, Throw),
    Sizeof => (0xFE, 0x1C, "sizeof", InlineType, Sequential),
    Refanytype => (0xFE, 0x1D, "refanytype", InlineNone, Sequential),
    Readonly => (0xFE, 0x1E, "readonly.", InlineNone, Sequential),
}

impl OpCode {
    /// The ILAsm mnemonic.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// The inline operand kind.
    #[must_use]
    pub const fn operand_type(self) -> OperandType {
        self.info().operand_type
    }

    /// Control-flow behaviour.
    #[must_use]
    pub const fn flow(self) -> FlowType {
        self.info().flow
    }

    /// Encoded size of the opcode itself, without its operand.
    #[must_use]
    pub const fn size(self) -> usize {
        if self.info().prefix == 0 {
            1
        } else {
            2
        }
    }

    /// Returns `true` for opcodes whose operand is a branch target or jump table.
    #[must_use]
    pub const fn is_branch(self) -> bool {
        matches!(
            self.operand_type(),
            OperandType::ShortInlineBrTarget
                | OperandType::InlineBrTarget
                | OperandType::InlineSwitch
        )
    }

    /// The slot family this opcode belongs to, if it loads or stores an argument or local.
    #[must_use]
    pub const fn family(self) -> Option<SlotFamily> {
        match self {
            OpCode::Ldarg0
            | OpCode::Ldarg1
            | OpCode::Ldarg2
            | OpCode::Ldarg3
            | OpCode::LdargS
            | OpCode::Ldarg => Some(SlotFamily::Ldarg),
            OpCode::LdargaS | OpCode::Ldarga => Some(SlotFamily::Ldarga),
            OpCode::StargS | OpCode::Starg => Some(SlotFamily::Starg),
            OpCode::Ldloc0
            | OpCode::Ldloc1
            | OpCode::Ldloc2
            | OpCode::Ldloc3
            | OpCode::LdlocS
            | OpCode::Ldloc => Some(SlotFamily::Ldloc),
            OpCode::LdlocaS | OpCode::Ldloca => Some(SlotFamily::Ldloca),
            OpCode::Stloc0
            | OpCode::Stloc1
            | OpCode::Stloc2
            | OpCode::Stloc3
            | OpCode::StlocS
            | OpCode::Stloc => Some(SlotFamily::Stloc),
            _ => None,
        }
    }

    /// The slot index encoded in a shorthand opcode such as `ldloc.2`.
    #[must_use]
    pub const fn implicit_slot(self) -> Option<u16> {
        match self {
            OpCode::Ldarg0 | OpCode::Ldloc0 | OpCode::Stloc0 => Some(0),
            OpCode::Ldarg1 | OpCode::Ldloc1 | OpCode::Stloc1 => Some(1),
            OpCode::Ldarg2 | OpCode::Ldloc2 | OpCode::Stloc2 => Some(2),
            OpCode::Ldarg3 | OpCode::Ldloc3 | OpCode::Stloc3 => Some(3),
            _ => None,
        }
    }

    /// The 32-bit form of a short branch, or `self` if there is none.
    #[must_use]
    pub const fn long_form(self) -> OpCode {
        match self {
            OpCode::BrS => OpCode::Br,
            OpCode::BrfalseS => OpCode::Brfalse,
            OpCode::BrtrueS => OpCode::Brtrue,
            OpCode::BeqS => OpCode::Beq,
            OpCode::BgeS => OpCode::Bge,
            OpCode::BgtS => OpCode::Bgt,
            OpCode::BleS => OpCode::Ble,
            OpCode::BltS => OpCode::Blt,
            OpCode::BneUnS => OpCode::BneUn,
            OpCode::BgeUnS => OpCode::BgeUn,
            OpCode::BgtUnS => OpCode::BgtUn,
            OpCode::BleUnS => OpCode::BleUn,
            OpCode::BltUnS => OpCode::BltUn,
            OpCode::LeaveS => OpCode::Leave,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_encoding_roundtrip() {
        for opcode in OpCode::iter() {
            let info = opcode.info();
            assert_eq!(
                OpCode::decode(info.prefix, info.code),
                Some(opcode),
                "{opcode}"
            );
        }
    }

    #[test]
    fn test_mnemonic_parse() {
        for opcode in OpCode::iter() {
            assert_eq!(OpCode::from_str(opcode.mnemonic()).unwrap(), opcode);
            assert_eq!(opcode.to_string(), opcode.mnemonic());
        }
        assert!(OpCode::from_str("ldloc.9").is_err());
    }

    #[test]
    fn test_reserved_opcodes() {
        assert_eq!(OpCode::decode(0x00, 0x24), None);
        assert_eq!(OpCode::decode(0xFE, 0x08), None);
        assert_eq!(OpCode::decode(0xFE, 0x1B), None);
    }

    #[test]
    fn test_families() {
        assert!(SlotFamily::Ldloc.matches(OpCode::Ldloc0));
        assert!(SlotFamily::Ldloc.matches(OpCode::LdlocS));
        assert!(SlotFamily::Ldloc.matches(OpCode::Ldloc));
        assert!(!SlotFamily::Ldloc.matches(OpCode::Stloc0));
        assert!(SlotFamily::Stloc.is_local());
        assert!(!SlotFamily::Ldarg.is_local());
        assert_eq!(OpCode::Call.family(), None);
    }

    #[test]
    fn test_long_forms_are_branches() {
        for opcode in OpCode::iter().filter(|op| op.operand_type() == OperandType::ShortInlineBrTarget) {
            let long = opcode.long_form();
            assert_ne!(long, opcode);
            assert_eq!(long.operand_type(), OperandType::InlineBrTarget);
            assert_eq!(long.flow(), opcode.flow());
        }
    }
}
