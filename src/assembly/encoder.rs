//! CIL bytecode encoding.
//!
//! [`encode_stream`] is the reverse of [`crate::assembly::decode_stream`]: it lays out a list
//! of instructions, converts [`InstructionId`] branch targets back into relative
//! displacements and asks a [`TokenProvider`] for the metadata token of every reference.
//!
//! Short branches whose displacement no longer fits into a signed byte (typically because code
//! was inserted between the branch and its target) are widened to their 32-bit form. Widening
//! changes the layout, so it is repeated until no further branch needs it. Branches that still
//! fit keep the encoding they were decoded with.

use std::collections::HashMap;

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, InstructionId, Operand},
        opcodes::{OpCode, OperandType},
    },
    file::io::write_le_to,
    metadata::token::Token,
    Result,
};

/// Maps references in instruction operands to metadata tokens.
///
/// Implemented by the metadata writer, which owns the token assignment for the module being
/// written.
pub trait TokenProvider {
    /// Returns the token to emit for `operand`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnresolvedReference`] for members that are neither defined in
    /// the module nor imported into it.
    fn token(&mut self, operand: &Operand) -> Result<Token>;
}

/// The result of encoding one code stream.
#[derive(Debug)]
pub struct EncodedStream {
    /// The encoded code bytes
    pub bytes: Vec<u8>,
    offsets: HashMap<InstructionId, u32>,
    widened: usize,
}

impl EncodedStream {
    /// The byte offset at which the instruction with `id` was emitted.
    #[must_use]
    pub fn offset_of(&self, id: InstructionId) -> Option<u32> {
        self.offsets.get(&id).copied()
    }

    /// Size of the code in bytes.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let size = self.bytes.len() as u32;
        size
    }

    /// How many short branches had to be widened.
    #[must_use]
    pub fn widened(&self) -> usize {
        self.widened
    }
}

/// Encodes a list of instructions.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if an operand does not fit its opcode or a branch
/// targets an instruction that is not part of `instructions`, and propagates errors of
/// `provider`.
pub fn encode_stream(
    instructions: &[Instruction],
    provider: &mut dyn TokenProvider,
) -> Result<EncodedStream> {
    for (index, instruction) in instructions.iter().enumerate() {
        if !instruction.operand.fits(instruction.opcode) {
            return Err(malformed_error!(
                "Operand {:?} does not fit '{}' at index {}",
                instruction.operand,
                instruction.opcode,
                index
            ));
        }
    }

    let positions: HashMap<InstructionId, usize> = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| (instruction.id(), index))
        .collect();

    let mut opcodes: Vec<OpCode> = instructions.iter().map(|i| i.opcode).collect();
    let mut widened = 0;
    let offsets = loop {
        let offsets = layout(instructions, &opcodes);
        let mut changed = false;

        for (index, instruction) in instructions.iter().enumerate() {
            if opcodes[index].operand_type() != OperandType::ShortInlineBrTarget {
                continue;
            }
            let displacement = displacement(instructions, &positions, &offsets, index, instruction.operand.targets()[0])?;
            if i8::try_from(displacement).is_err() {
                opcodes[index] = opcodes[index].long_form();
                widened += 1;
                changed = true;
            }
        }

        if !changed {
            break offsets;
        }
    };

    if widened > 0 {
        log::debug!("Widened {widened} short branch(es) while encoding");
    }

    let mut bytes = Vec::with_capacity(offsets[instructions.len()] as usize);
    for (index, instruction) in instructions.iter().enumerate() {
        let opcode = opcodes[index];
        let info = opcode.info();
        if info.prefix != 0 {
            bytes.push(info.prefix);
        }
        bytes.push(info.code);

        match (&instruction.operand, opcode.operand_type()) {
            (_, OperandType::InlineNone) => {}
            (Operand::Immediate(immediate), _) => match *immediate {
                Immediate::Int8(value) => write_le_to(&mut bytes, value),
                Immediate::UInt8(value) => write_le_to(&mut bytes, value),
                Immediate::Int32(value) => write_le_to(&mut bytes, value),
                Immediate::Int64(value) => write_le_to(&mut bytes, value),
                Immediate::Float32(value) => write_le_to(&mut bytes, value),
                Immediate::Float64(value) => write_le_to(&mut bytes, value),
            },
            (Operand::Local(slot) | Operand::Argument(slot), OperandType::ShortInlineVar | OperandType::ShortInlineArg) => {
                #[allow(clippy::cast_possible_truncation)]
                bytes.push(*slot as u8);
            }
            (Operand::Local(slot) | Operand::Argument(slot), _) => write_le_to(&mut bytes, *slot),
            (Operand::Target(target), OperandType::ShortInlineBrTarget) => {
                let value = displacement(instructions, &positions, &offsets, index, *target)?;
                #[allow(clippy::cast_possible_truncation)]
                write_le_to(&mut bytes, value as i8);
            }
            (Operand::Target(target), _) => {
                let value = displacement(instructions, &positions, &offsets, index, *target)?;
                #[allow(clippy::cast_possible_truncation)]
                write_le_to(&mut bytes, value as i32);
            }
            (Operand::Switch(targets), _) => {
                #[allow(clippy::cast_possible_truncation)]
                write_le_to(&mut bytes, targets.len() as u32);
                for target in targets {
                    let value = displacement(instructions, &positions, &offsets, index, *target)?;
                    #[allow(clippy::cast_possible_truncation)]
                    write_le_to(&mut bytes, value as i32);
                }
            }
            (operand, _) => write_le_to(&mut bytes, provider.token(operand)?.value()),
        }
    }

    let offsets = instructions
        .iter()
        .zip(offsets.iter())
        .map(|(instruction, offset)| (instruction.id(), *offset))
        .collect();

    Ok(EncodedStream {
        bytes,
        offsets,
        widened,
    })
}

/// Encoded size of one instruction with the given (possibly widened) opcode.
fn instruction_size(instruction: &Instruction, opcode: OpCode) -> u32 {
    let operand = match opcode.operand_type().size() {
        Some(size) => size,
        None => 4 + 4 * instruction.operand.targets().len(),
    };
    #[allow(clippy::cast_possible_truncation)]
    let size = (opcode.size() + operand) as u32;
    size
}

/// Offsets of every instruction plus the end of code as the final entry.
fn layout(instructions: &[Instruction], opcodes: &[OpCode]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut offset = 0u32;
    for (instruction, opcode) in instructions.iter().zip(opcodes) {
        offsets.push(offset);
        offset += instruction_size(instruction, *opcode);
    }
    offsets.push(offset);
    offsets
}

fn displacement(
    instructions: &[Instruction],
    positions: &HashMap<InstructionId, usize>,
    offsets: &[u32],
    source: usize,
    target: InstructionId,
) -> Result<i64> {
    let Some(target_index) = positions.get(&target) else {
        return Err(malformed_error!(
            "'{}' at index {} targets {} which is not part of the body",
            instructions[source].opcode,
            source,
            target
        ));
    };

    // The end of the source instruction is the start of the next one.
    let next = i64::from(offsets[source + 1]);
    Ok(i64::from(offsets[*target_index]) - next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::decoder::{decode_stream, TokenResolver},
        Error,
    };

    struct Strings;

    impl TokenProvider for Strings {
        fn token(&mut self, operand: &Operand) -> Result<Token> {
            match operand {
                Operand::String(_) => Ok(Token::new(0x7000_0001)),
                other => Err(Error::UnresolvedReference(other.to_string())),
            }
        }
    }

    impl TokenResolver for Strings {
        fn resolve(&self, _: OperandType, token: Token) -> Result<Operand> {
            match token.value() {
                0x7000_0001 => Ok(Operand::String("hello".into())),
                _ => Err(Error::UnresolvedReference(token.to_string())),
            }
        }
    }

    #[test]
    fn test_roundtrip_is_exact() {
        let code = [
            0x02, // ldarg.0
            0x2D, 0x06, // brtrue.s +6
            0x72, 0x01, 0x00, 0x00, 0x70, // ldstr
            0x26, // pop
            0x13, 0x05, // stloc.s 5
            0xFE, 0x0C, 0x2C, 0x01, // ldloc 300
            0x2A, // ret
        ];
        let stream = decode_stream(&code, &Strings).unwrap();
        let encoded = encode_stream(&stream.instructions, &mut Strings).unwrap();
        assert_eq!(encoded.bytes, code);
        assert_eq!(encoded.widened(), 0);
        assert_eq!(encoded.offset_of(stream.instructions[2].id()), Some(3));
    }

    #[test]
    fn test_widens_overflowing_short_branch() {
        // br.s +0; ret
        let code = [0x2B, 0x00, 0x2A];
        let stream = decode_stream(&code, &Strings).unwrap();
        let mut instructions = stream.instructions;

        let mut id = 100;
        let padding: Vec<Instruction> = (0..200)
            .map(|_| {
                let mut nop = Instruction::simple(OpCode::Nop);
                nop.set_id(InstructionId::new(id));
                id += 1;
                nop
            })
            .collect();
        instructions.splice(1..1, padding);

        let encoded = encode_stream(&instructions, &mut Strings).unwrap();
        assert_eq!(encoded.widened(), 1);
        assert_eq!(encoded.bytes[0], 0x38);
        assert_eq!(&encoded.bytes[1..5], &200i32.to_le_bytes());
        assert_eq!(encoded.code_size(), 5 + 200 + 1);
        // The model itself keeps the short form.
        assert_eq!(instructions[0].opcode, OpCode::BrS);
    }

    #[test]
    fn test_dangling_target() {
        let mut branch = Instruction::new(OpCode::Br, Operand::Target(InstructionId::new(9)));
        branch.set_id(InstructionId::new(1));
        assert!(matches!(
            encode_stream(&[branch], &mut Strings),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_operand_mismatch() {
        let bad = Instruction::new(OpCode::Call, Operand::None);
        assert!(encode_stream(&[bad], &mut Strings).is_err());
    }
}
