//! Editable CIL method bodies.
//!
//! A [`MethodBody`] owns the decoded instruction list, local variable types, exception
//! handling clauses and the stack limit of one method. It is decoded from, and encoded back
//! into, the ECMA-335 body layout (II.25.4): a tiny or fat header, the code bytes and optional
//! exception handling data sections.
//!
//! The header format a body was decoded with is remembered. A fat body stays fat, and a tiny
//! body stays tiny for as long as it still qualifies (no locals, no exception handlers, at
//! most 63 bytes of code, a stack of at most 8), so an unmodified body encodes to the bytes it
//! was decoded from.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::assembly::{Instruction, OpCode, Operand};
//! use cilpatch::metadata::method::MethodBody;
//!
//! let mut body = MethodBody::new();
//! let ret = body.create(OpCode::Ret, Operand::None);
//! let skip = body.create(OpCode::BrS, Operand::Target(ret.id()));
//! body.append(vec![skip, Instruction::simple(OpCode::Nop), ret]);
//!
//! assert_eq!(body.listing(), "IL_0000: br.s IL_0002\nIL_0001: nop\nIL_0002: ret\n");
//! ```

use std::{collections::HashMap, fmt::Write as _};

use crate::{
    assembly::{
        decode_stream, encode_stream, Instruction, InstructionId, OpCode, Operand, OperandType,
        TokenProvider, TokenResolver,
    },
    file::{
        io::{pad_to, write_le_to},
        parser::Parser,
    },
    metadata::{
        method::{
            exceptions::RawExceptionHandler, ExceptionHandler, ExceptionHandlerFlags,
            MethodBodyFlags, SectionFlags,
        },
        signatures::TypeSig,
        token::Token,
    },
    Result,
};

const TINY_MAX_CODE: u32 = 63;
const TINY_MAX_STACK: u16 = 8;
const FAT_HEADER_DWORDS: u16 = 3;

/// Resolves the tokens a method body refers to while decoding it.
pub trait BodyResolver: TokenResolver {
    /// Resolves the stand-alone signature token of the local variable list.
    ///
    /// # Errors
    ///
    /// Returns an error if the token does not name a local variable signature.
    fn local_signature(&self, token: Token) -> Result<Vec<TypeSig>>;
}

/// Assigns tokens to the references of a method body while encoding it.
pub trait BodyEmitter: TokenProvider {
    /// Returns the stand-alone signature token for a local variable list.
    ///
    /// # Errors
    ///
    /// Returns an error if a local's type cannot be referenced from the module.
    fn local_signature_token(&mut self, locals: &[TypeSig]) -> Result<Token>;
}

/// An editable method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Maximum number of items on the evaluation stack
    pub max_stack: u16,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// Local variable types; the index is the slot used by `ldloc`/`stloc`
    pub locals: Vec<TypeSig>,
    /// The instruction list
    pub instructions: Vec<Instruction>,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
    fat_header: bool,
    next_id: u32,
}

impl Default for MethodBody {
    fn default() -> Self {
        MethodBody::new()
    }
}

impl MethodBody {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        MethodBody {
            max_stack: TINY_MAX_STACK,
            init_locals: false,
            locals: Vec::new(),
            instructions: Vec::new(),
            exception_handlers: Vec::new(),
            fat_header: false,
            next_id: 1,
        }
    }

    /// Creates an instruction with an id reserved in this body.
    ///
    /// Use this for instructions that other instructions branch to before they are inserted.
    pub fn create(&mut self, opcode: OpCode, operand: Operand) -> Instruction {
        let mut instruction = Instruction::new(opcode, operand);
        instruction.set_id(self.allocate_id());
        instruction
    }

    pub(crate) fn allocate_id(&mut self) -> InstructionId {
        let id = InstructionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Returns `true` if `id` was allocated by this body.
    pub(crate) fn owns(&self, id: InstructionId) -> bool {
        !id.is_detached() && id.value() < self.next_id
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the body has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Position of the instruction with `id`.
    #[must_use]
    pub fn index_of(&self, id: InstructionId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id() == id)
    }

    /// Raises `max_stack` to at least `depth`.
    pub fn reserve_stack(&mut self, depth: u16) {
        self.max_stack = self.max_stack.max(depth);
    }

    /// Returns `true` if the body was decoded with a fat header.
    #[must_use]
    pub fn has_fat_header(&self) -> bool {
        self.fat_header
    }

    /// Decodes a body from its header onwards.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for unknown header formats, undecodable code or
    /// exception clauses that do not line up with instruction boundaries, and
    /// [`crate::Error::OutOfBounds`] for truncated data.
    pub fn decode<R: BodyResolver>(data: &[u8], resolver: &R) -> Result<MethodBody> {
        let mut parser = Parser::new(data);
        let first_byte = parser.peek_byte()?;

        let (header_size, code_size, max_stack, flags, local_token) =
            match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b11)) {
                MethodBodyFlags::TINY_FORMAT => (
                    1usize,
                    u32::from(first_byte >> 2),
                    TINY_MAX_STACK,
                    MethodBodyFlags::TINY_FORMAT,
                    0u32,
                ),
                MethodBodyFlags::FAT_FORMAT => {
                    let flags_word = parser.read_le::<u16>()?;
                    let max_stack = parser.read_le::<u16>()?;
                    let code_size = parser.read_le::<u32>()?;
                    let local_token = parser.read_le::<u32>()?;
                    let header_size = usize::from(flags_word >> 12) * 4;
                    if header_size < 12 {
                        return Err(malformed_error!(
                            "Fat method header declares {} bytes",
                            header_size
                        ));
                    }
                    (
                        header_size,
                        code_size,
                        max_stack,
                        MethodBodyFlags::from_bits_truncate(flags_word & 0x0FFF),
                        local_token,
                    )
                }
                _ => {
                    return Err(malformed_error!(
                        "MethodHeader is neither FAT nor TINY - {}",
                        first_byte
                    ))
                }
            };

        parser.seek(header_size)?;
        let code = parser.read_bytes(code_size as usize)?;
        let stream = decode_stream(code, resolver)?;

        let locals = if local_token == 0 {
            Vec::new()
        } else {
            resolver.local_signature(Token::new(local_token))?
        };

        let mut exception_handlers = Vec::new();
        if flags.contains(MethodBodyFlags::MORE_SECTS) {
            for raw in read_sections(&mut parser, header_size + code_size as usize)? {
                let id_at = |offset: u32, what: &str| {
                    stream.id_at(offset).ok_or_else(|| {
                        malformed_error!(
                            "Exception clause {} at IL_{:04X} is not an instruction boundary",
                            what,
                            offset
                        )
                    })
                };
                let end_at = |offset: u32, what: &str| {
                    if offset == stream.code_size {
                        Ok(None)
                    } else {
                        id_at(offset, what).map(Some)
                    }
                };

                #[allow(clippy::cast_possible_truncation)]
                let clause = ExceptionHandlerFlags::from_bits_truncate(raw.flags as u16);
                let catch_type = if clause == ExceptionHandlerFlags::EXCEPTION {
                    match resolver.resolve(OperandType::InlineType, Token::new(raw.class_or_filter))? {
                        Operand::Type(reference)
                        | Operand::TypeSig(TypeSig::Class(reference) | TypeSig::ValueType(reference)) => {
                            Some(reference)
                        }
                        other => {
                            return Err(malformed_error!(
                                "Catch clause resolved to {:?} instead of a type",
                                other
                            ))
                        }
                    }
                } else {
                    None
                };
                let filter_start = if clause.contains(ExceptionHandlerFlags::FILTER) {
                    Some(id_at(raw.class_or_filter, "filter")?)
                } else {
                    None
                };

                exception_handlers.push(ExceptionHandler {
                    flags: clause,
                    try_start: id_at(raw.try_offset, "try start")?,
                    try_end: end_at(raw.try_offset.saturating_add(raw.try_length), "try end")?,
                    handler_start: id_at(raw.handler_offset, "handler start")?,
                    handler_end: end_at(
                        raw.handler_offset.saturating_add(raw.handler_length),
                        "handler end",
                    )?,
                    catch_type,
                    filter_start,
                });
            }
        }

        let next_id = stream.next_id();
        Ok(MethodBody {
            max_stack,
            init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
            locals,
            instructions: stream.instructions,
            exception_handlers,
            fat_header: flags.contains(MethodBodyFlags::FAT_FORMAT),
            next_id,
        })
    }

    /// Encodes the body, header included.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if an instruction or exception clause refers to an
    /// instruction that is not part of the body, and propagates errors of `emitter`.
    pub fn encode<E: BodyEmitter>(&self, emitter: &mut E) -> Result<Vec<u8>> {
        let stream = encode_stream(&self.instructions, emitter)?;
        let code_size = stream.code_size();

        let local_token = if self.locals.is_empty() {
            0
        } else {
            emitter.local_signature_token(&self.locals)?.value()
        };

        let offset_of = |id: InstructionId| {
            stream.offset_of(id).ok_or_else(|| {
                malformed_error!("Exception clause refers to {} which is not part of the body", id)
            })
        };
        let end_of = |id: Option<InstructionId>| match id {
            Some(id) => offset_of(id),
            None => Ok(code_size),
        };

        let mut raw_handlers = Vec::with_capacity(self.exception_handlers.len());
        for handler in &self.exception_handlers {
            let try_offset = offset_of(handler.try_start)?;
            let handler_offset = offset_of(handler.handler_start)?;
            let class_or_filter = if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
                let filter = handler
                    .filter_start
                    .ok_or_else(|| malformed_error!("Filter clause without filter code"))?;
                offset_of(filter)?
            } else if handler.flags == ExceptionHandlerFlags::EXCEPTION {
                let catch_type = handler
                    .catch_type
                    .clone()
                    .ok_or_else(|| malformed_error!("Catch clause without a caught type"))?;
                emitter.token(&Operand::Type(catch_type))?.value()
            } else {
                0
            };

            raw_handlers.push(RawExceptionHandler {
                flags: u32::from(handler.flags.bits()),
                try_offset,
                try_length: end_of(handler.try_end)?.saturating_sub(try_offset),
                handler_offset,
                handler_length: end_of(handler.handler_end)?.saturating_sub(handler_offset),
                class_or_filter,
            });
        }

        let tiny = !self.fat_header
            && local_token == 0
            && raw_handlers.is_empty()
            && !self.init_locals
            && code_size <= TINY_MAX_CODE
            && self.max_stack <= TINY_MAX_STACK;

        let mut data = Vec::with_capacity(12 + stream.bytes.len());
        if tiny {
            #[allow(clippy::cast_possible_truncation)]
            data.push(((code_size as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
            data.extend_from_slice(&stream.bytes);
            return Ok(data);
        }

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !raw_handlers.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        write_le_to(&mut data, flags.bits() | (FAT_HEADER_DWORDS << 12));
        write_le_to(&mut data, self.max_stack);
        write_le_to(&mut data, code_size);
        write_le_to(&mut data, local_token);
        data.extend_from_slice(&stream.bytes);

        if !raw_handlers.is_empty() {
            pad_to(&mut data, 4);
            let section_size = 4 + 24 * raw_handlers.len() as u32;
            data.push((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits());
            data.extend_from_slice(&section_size.to_le_bytes()[..3]);
            for raw in raw_handlers {
                write_le_to(&mut data, raw.flags);
                write_le_to(&mut data, raw.try_offset);
                write_le_to(&mut data, raw.try_length);
                write_le_to(&mut data, raw.handler_offset);
                write_le_to(&mut data, raw.handler_length);
                write_le_to(&mut data, raw.class_or_filter);
            }
        }

        Ok(data)
    }

    /// Renders the body as one `IL_nnnn: mnemonic operand` line per instruction.
    ///
    /// Labels are instruction indices, not byte offsets.
    #[must_use]
    pub fn listing(&self) -> String {
        let labels: HashMap<InstructionId, usize> = self
            .instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.id(), index))
            .collect();
        let label = |id: &InstructionId| match labels.get(id) {
            Some(index) => format!("IL_{index:04}"),
            None => id.to_string(),
        };
        let end = |id: &Option<InstructionId>| id.as_ref().map_or_else(|| "end".to_string(), label);

        let mut out = String::new();
        for (index, instruction) in self.instructions.iter().enumerate() {
            let _ = match &instruction.operand {
                Operand::Target(target) => {
                    writeln!(out, "IL_{index:04}: {} {}", instruction.opcode, label(target))
                }
                Operand::Switch(targets) => {
                    let targets: Vec<String> = targets.iter().map(label).collect();
                    writeln!(out, "IL_{index:04}: {} ({})", instruction.opcode, targets.join(", "))
                }
                _ => writeln!(out, "IL_{index:04}: {instruction}"),
            };
        }

        for handler in &self.exception_handlers {
            let kind = match handler.flags {
                ExceptionHandlerFlags::FINALLY => "finally".to_string(),
                ExceptionHandlerFlags::FAULT => "fault".to_string(),
                ExceptionHandlerFlags::FILTER => "filter".to_string(),
                _ => match &handler.catch_type {
                    Some(catch_type) => format!("catch {}", catch_type.full_name()),
                    None => "catch".to_string(),
                },
            };
            let _ = writeln!(
                out,
                ".try {} to {} {kind} handler {} to {}",
                label(&handler.try_start),
                end(&handler.try_end),
                label(&handler.handler_start),
                end(&handler.handler_end),
            );
        }

        out
    }
}

/// Reads the exception handling data sections that follow the code.
fn read_sections(parser: &mut Parser<'_>, code_end: usize) -> Result<Vec<RawExceptionHandler>> {
    let mut handlers = Vec::new();
    let mut cursor = (code_end + 3) & !3;

    loop {
        parser.seek(cursor)?;
        let section = SectionFlags::from_bits_truncate(parser.read_le::<u8>()?);
        if !section.contains(SectionFlags::EHTABLE) {
            return Err(malformed_error!(
                "Unsupported method data section 0x{:02X}",
                section.bits()
            ));
        }

        if section.contains(SectionFlags::FAT_FORMAT) {
            let size_bytes = parser.read_bytes(3)?;
            let size = u32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], 0]);
            if size < 4 {
                return Err(malformed_error!("Exception section of {} bytes", size));
            }
            for _ in 0..(size - 4) / 24 {
                handlers.push(RawExceptionHandler {
                    flags: parser.read_le::<u32>()?,
                    try_offset: parser.read_le::<u32>()?,
                    try_length: parser.read_le::<u32>()?,
                    handler_offset: parser.read_le::<u32>()?,
                    handler_length: parser.read_le::<u32>()?,
                    class_or_filter: parser.read_le::<u32>()?,
                });
            }
            cursor += size as usize;
        } else {
            let size = u32::from(parser.read_le::<u8>()?);
            parser.advance_by(2)?;
            if size < 4 {
                return Err(malformed_error!("Exception section of {} bytes", size));
            }
            for _ in 0..(size - 4) / 12 {
                handlers.push(RawExceptionHandler {
                    flags: u32::from(parser.read_le::<u16>()?),
                    try_offset: u32::from(parser.read_le::<u16>()?),
                    try_length: u32::from(parser.read_le::<u8>()?),
                    handler_offset: u32::from(parser.read_le::<u16>()?),
                    handler_length: u32::from(parser.read_le::<u8>()?),
                    class_or_filter: parser.read_le::<u32>()?,
                });
            }
            cursor += size as usize;
        }

        if !section.contains(SectionFlags::MORE_SECTS) {
            return Ok(handlers);
        }
        cursor = (cursor + 3) & !3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::references::{ResolutionScope, TypeRef},
        Error,
    };

    struct Context;

    fn exception_type() -> TypeRef {
        TypeRef::new(ResolutionScope::Assembly("mscorlib".into()), "System", "Exception")
    }

    impl TokenResolver for Context {
        fn resolve(&self, _: OperandType, token: Token) -> Result<Operand> {
            match token.value() {
                0x0100_0001 => Ok(Operand::Type(exception_type())),
                _ => Err(Error::UnresolvedReference(token.to_string())),
            }
        }
    }

    impl BodyResolver for Context {
        fn local_signature(&self, token: Token) -> Result<Vec<TypeSig>> {
            assert_eq!(token.value(), 0x1100_0001);
            Ok(vec![TypeSig::Int32])
        }
    }

    impl TokenProvider for Context {
        fn token(&mut self, operand: &Operand) -> Result<Token> {
            match operand {
                Operand::Type(reference) if reference == &exception_type() => {
                    Ok(Token::new(0x0100_0001))
                }
                other => Err(Error::UnresolvedReference(other.to_string())),
            }
        }
    }

    impl BodyEmitter for Context {
        fn local_signature_token(&mut self, locals: &[TypeSig]) -> Result<Token> {
            assert_eq!(locals, [TypeSig::Int32]);
            Ok(Token::new(0x1100_0001))
        }
    }

    #[test]
    fn test_tiny() {
        // tiny header, 2 bytes of code: nop; ret
        let data = [0x0A, 0x00, 0x2A];
        let body = MethodBody::decode(&data, &Context).unwrap();
        assert!(!body.has_fat_header());
        assert_eq!(body.max_stack, 8);
        assert_eq!(body.len(), 2);
        assert_eq!(body.encode(&mut Context).unwrap(), data);
    }

    #[test]
    fn test_fat_with_locals() {
        let data = [
            0x13, 0x30, // FAT | INIT_LOCALS, 3 dwords
            0x02, 0x00, // max stack 2
            0x03, 0x00, 0x00, 0x00, // code size 3
            0x01, 0x00, 0x00, 0x11, // local sig token
            0x16, 0x0A, 0x2A, // ldc.i4.0; stloc.0; ret
        ];
        let body = MethodBody::decode(&data, &Context).unwrap();
        assert!(body.has_fat_header());
        assert!(body.init_locals);
        assert_eq!(body.max_stack, 2);
        assert_eq!(body.locals, vec![TypeSig::Int32]);
        assert_eq!(body.instructions[1].operand, Operand::Local(0));
        assert_eq!(body.encode(&mut Context).unwrap(), data);
    }

    #[test]
    fn test_fat_exceptions() {
        let mut data = vec![
            0x0B, 0x30, // FAT | MORE_SECTS
            0x01, 0x00, // max stack 1
            0x07, 0x00, 0x00, 0x00, // code size 7
            0x00, 0x00, 0x00, 0x00, // no locals
            0x00, // nop
            0xDE, 0x03, // leave.s ret
            0x26, // pop
            0xDE, 0x00, // leave.s ret
            0x2A, // ret
            0x00, // align
            0x41, 0x1C, 0x00, 0x00, // fat EH section, one clause
        ];
        for value in [0u32, 0, 3, 3, 3, 0x0100_0001] {
            data.extend_from_slice(&value.to_le_bytes());
        }

        let body = MethodBody::decode(&data, &Context).unwrap();
        assert_eq!(body.exception_handlers.len(), 1);
        let handler = &body.exception_handlers[0];
        assert_eq!(handler.flags, ExceptionHandlerFlags::EXCEPTION);
        assert_eq!(handler.catch_type, Some(exception_type()));
        assert_eq!(body.index_of(handler.try_start), Some(0));
        assert_eq!(handler.try_end.and_then(|id| body.index_of(id)), Some(2));
        assert_eq!(body.index_of(handler.handler_start), Some(2));
        assert_eq!(handler.handler_end.and_then(|id| body.index_of(id)), Some(4));
        assert_eq!(body.encode(&mut Context).unwrap(), data);
    }

    #[test]
    fn test_clause_inside_instruction() {
        let mut data = vec![
            0x0B, 0x30, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x1F, 0x05, // ldc.i4.s 5
            0x2A, // ret
            0x00, // align
            0x41, 0x1C, 0x00, 0x00,
        ];
        for value in [2u32, 1, 1, 2, 1, 0] {
            data.extend_from_slice(&value.to_le_bytes());
        }
        assert!(matches!(
            MethodBody::decode(&data, &Context),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_new_body_prefers_tiny() {
        let mut body = MethodBody::new();
        let ret = body.create(OpCode::Ret, Operand::None);
        body.instructions.push(ret);
        assert_eq!(body.encode(&mut Context).unwrap(), [0x06, 0x2A]);

        body.reserve_stack(9);
        let fat = body.encode(&mut Context).unwrap();
        assert_eq!(fat.len(), 13);
        assert_eq!(fat[0] & 0x3, 0x3);
    }

    #[test]
    fn test_unknown_header() {
        assert!(MethodBody::decode(&[0x00, 0x2A], &Context).is_err());
        assert!(MethodBody::decode(&[0x0E, 0x2A], &Context).is_err());
    }
}
