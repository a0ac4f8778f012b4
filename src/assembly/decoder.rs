//! CIL bytecode decoding.
//!
//! [`decode_stream`] turns the code bytes of a method body into a list of editable
//! [`Instruction`]s. Metadata tokens are resolved into by-value references through a
//! [`TokenResolver`], branch displacements are converted into [`InstructionId`] targets, and
//! shorthand loads and stores are normalized to carry an explicit slot operand.
//!
//! Decoding is linear: every byte of the code stream must belong to exactly one instruction and
//! every branch must land on an instruction boundary. Anything else is reported as
//! [`crate::Error::Malformed`].
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::assembly::{decode_stream, OpCode, Operand, OperandType, TokenResolver};
//! use cilpatch::metadata::token::Token;
//!
//! struct NoTokens;
//! impl TokenResolver for NoTokens {
//!     fn resolve(&self, _: OperandType, token: Token) -> cilpatch::Result<Operand> {
//!         Err(cilpatch::Error::UnresolvedReference(token.to_string()))
//!     }
//! }
//!
//! // ldarg.0; brtrue.s +1; nop; ret
//! let code = [0x02, 0x2D, 0x01, 0x00, 0x2A];
//! let stream = decode_stream(&code, &NoTokens)?;
//! assert_eq!(stream.instructions.len(), 4);
//! assert_eq!(stream.instructions[0].operand, Operand::Argument(0));
//! assert_eq!(
//!     stream.instructions[1].operand,
//!     Operand::Target(stream.instructions[3].id())
//! );
//! # Ok::<(), cilpatch::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, InstructionId, Operand},
        opcodes::{OpCode, OperandType, SlotFamily},
    },
    file::parser::Parser,
    metadata::token::Token,
    Result,
};

/// Maps metadata tokens found in the code stream to resolved operands.
///
/// Implemented by the metadata loader, which knows the module's tables. `operand_type` tells
/// the resolver which kind of token the opcode expects.
pub trait TokenResolver {
    /// Resolves `token` for an operand of kind `operand_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is null, out of range or of the wrong table.
    fn resolve(&self, operand_type: OperandType, token: Token) -> Result<Operand>;
}

/// The result of decoding one code stream.
#[derive(Debug)]
pub struct DecodedStream {
    /// The decoded instructions, with ids `1..=len`
    pub instructions: Vec<Instruction>,
    /// Byte offset of every instruction, parallel to `instructions`
    pub offsets: Vec<u32>,
    /// Total size of the code stream
    pub code_size: u32,
}

impl DecodedStream {
    /// The id of the instruction starting at `offset`.
    #[must_use]
    pub fn id_at(&self, offset: u32) -> Option<InstructionId> {
        self.offsets
            .binary_search(&offset)
            .ok()
            .map(|index| self.instructions[index].id())
    }

    /// The next free id after the decoded instructions.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        // Bodies with more than u32::MAX instructions cannot be encoded.
        #[allow(clippy::cast_possible_truncation)]
        let count = self.instructions.len() as u32;
        count + 1
    }
}

enum RawOperand {
    Resolved(Operand),
    Branch(i64),
    Switch(Vec<i64>),
}

/// Decodes a complete code stream.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for unknown opcodes or branches that do not land on an
/// instruction boundary, [`crate::Error::OutOfBounds`] for truncated operands, and any error
/// raised by `resolver`.
pub fn decode_stream(code: &[u8], resolver: &dyn TokenResolver) -> Result<DecodedStream> {
    let mut parser = Parser::new(code);
    let mut raw = Vec::new();
    let mut offsets = Vec::new();

    while parser.has_more_data() {
        #[allow(clippy::cast_possible_truncation)]
        offsets.push(parser.pos() as u32);
        raw.push(decode_instruction(&mut parser, resolver)?);
    }

    let by_offset: HashMap<i64, InstructionId> = offsets
        .iter()
        .enumerate()
        .map(|(index, offset)| (i64::from(*offset), id_for_index(index)))
        .collect();

    let resolve_target = |source: u32, target: i64| -> Result<InstructionId> {
        by_offset.get(&target).copied().ok_or_else(|| {
            malformed_error!(
                "Branch at IL_{:04X} targets offset {} which is not an instruction boundary",
                source,
                target
            )
        })
    };

    let mut instructions = Vec::with_capacity(raw.len());
    for (index, (opcode, operand)) in raw.into_iter().enumerate() {
        let operand = match operand {
            RawOperand::Resolved(operand) => operand,
            RawOperand::Branch(target) => Operand::Target(resolve_target(offsets[index], target)?),
            RawOperand::Switch(targets) => Operand::Switch(
                targets
                    .into_iter()
                    .map(|target| resolve_target(offsets[index], target))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        let mut instruction = Instruction::new(opcode, operand);
        instruction.set_id(id_for_index(index));
        instructions.push(instruction);
    }

    #[allow(clippy::cast_possible_truncation)]
    let code_size = code.len() as u32;

    Ok(DecodedStream {
        instructions,
        offsets,
        code_size,
    })
}

/// Offsets and values of every token operand in `code`, without resolving them.
///
/// Used to rewrite tokens of bodies that are otherwise copied byte for byte.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for unknown opcodes and
/// [`crate::Error::OutOfBounds`] for truncated operands.
pub(crate) fn token_offsets(code: &[u8]) -> Result<Vec<(usize, Token)>> {
    let mut parser = Parser::new(code);
    let mut tokens = Vec::new();

    while parser.has_more_data() {
        let start = parser.pos();
        let first = parser.read_le::<u8>()?;
        let (prefix, code) = if first == 0xFE {
            (0xFE, parser.read_le::<u8>()?)
        } else {
            (0, first)
        };
        let opcode = OpCode::decode(prefix, code)
            .ok_or_else(|| malformed_error!("Unknown opcode {:02X} at IL_{:04X}", code, start))?;

        let operand_type = opcode.operand_type();
        if operand_type.is_token() {
            let at = parser.pos();
            tokens.push((at, Token::new(parser.read_le::<u32>()?)));
        } else if let Some(size) = operand_type.size() {
            parser.advance_by(size)?;
        } else {
            let count = parser.read_le::<u32>()? as usize;
            parser.advance_by(count.checked_mul(4).ok_or(out_of_bounds_error!())?)?;
        }
    }

    Ok(tokens)
}

fn id_for_index(index: usize) -> InstructionId {
    #[allow(clippy::cast_possible_truncation)]
    InstructionId::new(index as u32 + 1)
}

fn decode_instruction(
    parser: &mut Parser<'_>,
    resolver: &dyn TokenResolver,
) -> Result<(OpCode, RawOperand)> {
    let start = parser.pos();
    let first = parser.read_le::<u8>()?;
    let opcode = if first == 0xFE {
        let second = parser.read_le::<u8>()?;
        OpCode::decode(0xFE, second)
            .ok_or_else(|| malformed_error!("Unknown opcode FE {:02X} at IL_{:04X}", second, start))?
    } else {
        OpCode::decode(0, first)
            .ok_or_else(|| malformed_error!("Unknown opcode {:02X} at IL_{:04X}", first, start))?
    };

    let operand = match opcode.operand_type() {
        OperandType::InlineNone => match (opcode.implicit_slot(), opcode.family()) {
            (Some(slot), Some(SlotFamily::Ldarg)) => RawOperand::Resolved(Operand::Argument(slot)),
            (Some(slot), Some(_)) => RawOperand::Resolved(Operand::Local(slot)),
            _ => RawOperand::Resolved(Operand::None),
        },
        OperandType::ShortInlineI => {
            RawOperand::Resolved(Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)))
        }
        OperandType::ShortInlineU => {
            RawOperand::Resolved(Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)))
        }
        OperandType::InlineI => {
            RawOperand::Resolved(Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)))
        }
        OperandType::InlineI8 => {
            RawOperand::Resolved(Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)))
        }
        OperandType::ShortInlineR => {
            RawOperand::Resolved(Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)))
        }
        OperandType::InlineR => {
            RawOperand::Resolved(Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)))
        }
        OperandType::InlineString
        | OperandType::InlineField
        | OperandType::InlineMethod
        | OperandType::InlineType
        | OperandType::InlineTok
        | OperandType::InlineSig => {
            let token = Token::new(parser.read_le::<u32>()?);
            RawOperand::Resolved(resolver.resolve(opcode.operand_type(), token)?)
        }
        OperandType::ShortInlineBrTarget => {
            let displacement = i64::from(parser.read_le::<i8>()?);
            RawOperand::Branch(parser.pos() as i64 + displacement)
        }
        OperandType::InlineBrTarget => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            RawOperand::Branch(parser.pos() as i64 + displacement)
        }
        OperandType::InlineSwitch => {
            let count = parser.read_le::<u32>()? as usize;
            if count.saturating_mul(4) > parser.remaining() {
                return Err(out_of_bounds_error!());
            }

            let mut displacements = Vec::with_capacity(count);
            for _ in 0..count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }

            let base = parser.pos() as i64;
            RawOperand::Switch(displacements.into_iter().map(|d| base + d).collect())
        }
        OperandType::ShortInlineVar => {
            RawOperand::Resolved(Operand::Local(u16::from(parser.read_le::<u8>()?)))
        }
        OperandType::InlineVar => RawOperand::Resolved(Operand::Local(parser.read_le::<u16>()?)),
        OperandType::ShortInlineArg => {
            RawOperand::Resolved(Operand::Argument(u16::from(parser.read_le::<u8>()?)))
        }
        OperandType::InlineArg => RawOperand::Resolved(Operand::Argument(parser.read_le::<u16>()?)),
    };

    Ok((opcode, operand))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            references::{MethodRef, ResolutionScope, TypeRef},
            signatures::{MethodSig, TypeSig},
        },
        Error,
    };

    struct Methods;

    impl TokenResolver for Methods {
        fn resolve(&self, operand_type: OperandType, token: Token) -> Result<Operand> {
            match (operand_type, token.value()) {
                (OperandType::InlineMethod, 0x0A00_0001) => Ok(Operand::Method(MethodRef::new(
                    TypeRef::new(ResolutionScope::Assembly("Lib".into()), "Lib", "Hooks"),
                    "Run",
                    MethodSig::new_static(TypeSig::Void, vec![]),
                ))),
                _ => Err(Error::UnresolvedReference(token.to_string())),
            }
        }
    }

    #[test]
    fn test_shorthand_normalization() {
        // ldarg.1; ldloc.2; stloc.s 5; ldloc 300; ret
        let code = [0x03, 0x08, 0x13, 0x05, 0xFE, 0x0C, 0x2C, 0x01, 0x2A];
        let stream = decode_stream(&code, &Methods).unwrap();
        let operands: Vec<_> = stream.instructions.iter().map(|i| i.operand.clone()).collect();
        assert_eq!(
            operands,
            vec![
                Operand::Argument(1),
                Operand::Local(2),
                Operand::Local(5),
                Operand::Local(300),
                Operand::None
            ]
        );
        assert_eq!(stream.offsets, vec![0, 1, 2, 4, 8]);
        assert_eq!(stream.code_size, 9);
    }

    #[test]
    fn test_tokens_and_branches() {
        // call 0A000001; br.s -7 (back to call); ret
        let code = [0x28, 0x01, 0x00, 0x00, 0x0A, 0x2B, 0xF9, 0x2A];
        let stream = decode_stream(&code, &Methods).unwrap();
        assert!(matches!(stream.instructions[0].operand, Operand::Method(_)));
        assert_eq!(
            stream.instructions[1].operand,
            Operand::Target(stream.instructions[0].id())
        );
        assert_eq!(stream.id_at(7), Some(stream.instructions[2].id()));
        assert_eq!(stream.id_at(3), None);
        assert_eq!(stream.next_id(), 4);
    }

    #[test]
    fn test_switch_targets() {
        // switch (2) [+0, +1]; nop; ret
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x2A,
        ];
        let stream = decode_stream(&code, &Methods).unwrap();
        let ids: Vec<_> = stream.instructions.iter().map(Instruction::id).collect();
        assert_eq!(stream.instructions[0].operand, Operand::Switch(vec![ids[1], ids[2]]));
    }

    #[test]
    fn test_branch_into_operand() {
        // br.s +1 lands inside the ldc.i4.s operand
        let code = [0x2B, 0x01, 0x1F, 0x05, 0x2A];
        assert!(decode_stream(&code, &Methods).is_err());
    }

    #[test]
    fn test_token_offsets() {
        // ldstr 70000001; switch (1) [+0]; ldsfld 04000003; newobj 0A000002; ret
        let code = [
            0x72, 0x01, 0x00, 0x00, 0x70, 0x45, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x7E, 0x03, 0x00, 0x00, 0x04, 0x73, 0x02, 0x00, 0x00, 0x0A, 0x2A,
        ];
        let tokens = token_offsets(&code).unwrap();
        assert_eq!(
            tokens,
            vec![
                (1, Token::new(0x7000_0001)),
                (15, Token::new(0x0400_0003)),
                (20, Token::new(0x0A00_0002)),
            ]
        );
        assert!(token_offsets(&[0x7E, 0x03]).is_err());
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            decode_stream(&[0x24], &Methods),
            Err(Error::Malformed { .. })
        ));
        assert!(decode_stream(&[0x28, 0x02, 0x00, 0x00, 0x0A], &Methods).is_err());
        assert!(matches!(
            decode_stream(&[0x20, 0x01], &Methods),
            Err(Error::OutOfBounds { .. })
        ));
    }
}
