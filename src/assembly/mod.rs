//! CIL instruction set: opcodes, editable instructions, decoding and encoding.
//!
//! # Key Components
//!
//! - [`OpCode`] - The ECMA-335 opcode table with mnemonics, operand kinds and flow types
//! - [`Instruction`] / [`Operand`] - Editable instructions with resolved operands
//! - [`decode_stream`] - Code bytes to instructions, via a [`TokenResolver`]
//! - [`encode_stream`] - Instructions to code bytes, via a [`TokenProvider`]
//!
//! The method body layer in [`crate::metadata::method`] wraps these with the body header,
//! local variables and exception handlers.

mod decoder;
mod encoder;
mod instruction;
mod opcodes;

pub(crate) use decoder::token_offsets;
pub use decoder::{decode_stream, DecodedStream, TokenResolver};
pub use encoder::{encode_stream, EncodedStream, TokenProvider};
pub use instruction::{Immediate, Instruction, InstructionId, Operand};
pub use opcodes::{FlowType, OpCode, OpCodeInfo, OperandType, SlotFamily};
