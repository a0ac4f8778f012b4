//! Type, method, field and local-variable signatures.
//!
//! Signatures are stored as blobs using the ECMA-335 element type encoding (II.23.2). Every
//! element type a compiler emits is modelled: primitives, class and value types, arrays,
//! pointers, by-refs, generic instantiations and parameters, function pointers and custom
//! modifiers. Method signatures carry their calling convention, generic arity and the vararg
//! tail following the sentinel.
//!
//! Class references inside signatures are resolved through caller-supplied closures, so the
//! same code serves the loader (token to [`TypeRef`]) and the writer ([`TypeRef`] to token).

use std::fmt;

use crate::{
    file::{io::write_compressed_uint, parser::Parser},
    metadata::{
        references::TypeRef,
        token::{table, Token},
    },
    Result,
};

const ELEMENT_TYPE_VOID: u8 = 0x01;
const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
const ELEMENT_TYPE_CHAR: u8 = 0x03;
const ELEMENT_TYPE_I1: u8 = 0x04;
const ELEMENT_TYPE_U1: u8 = 0x05;
const ELEMENT_TYPE_I2: u8 = 0x06;
const ELEMENT_TYPE_U2: u8 = 0x07;
const ELEMENT_TYPE_I4: u8 = 0x08;
const ELEMENT_TYPE_U4: u8 = 0x09;
const ELEMENT_TYPE_I8: u8 = 0x0A;
const ELEMENT_TYPE_U8: u8 = 0x0B;
const ELEMENT_TYPE_R4: u8 = 0x0C;
const ELEMENT_TYPE_R8: u8 = 0x0D;
const ELEMENT_TYPE_STRING: u8 = 0x0E;
const ELEMENT_TYPE_PTR: u8 = 0x0F;
const ELEMENT_TYPE_BYREF: u8 = 0x10;
const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
const ELEMENT_TYPE_CLASS: u8 = 0x12;
const ELEMENT_TYPE_VAR: u8 = 0x13;
const ELEMENT_TYPE_ARRAY: u8 = 0x14;
const ELEMENT_TYPE_GENERICINST: u8 = 0x15;
const ELEMENT_TYPE_TYPEDBYREF: u8 = 0x16;
const ELEMENT_TYPE_I: u8 = 0x18;
const ELEMENT_TYPE_U: u8 = 0x19;
const ELEMENT_TYPE_FNPTR: u8 = 0x1B;
const ELEMENT_TYPE_OBJECT: u8 = 0x1C;
const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;
const ELEMENT_TYPE_MVAR: u8 = 0x1E;
const ELEMENT_TYPE_CMOD_REQD: u8 = 0x1F;
const ELEMENT_TYPE_CMOD_OPT: u8 = 0x20;
const ELEMENT_TYPE_SENTINEL: u8 = 0x41;
const ELEMENT_TYPE_PINNED: u8 = 0x45;

const CALLCONV_MASK: u8 = 0x0F;
const CALLCONV_GENERIC: u8 = 0x10;
const CALLCONV_HASTHIS: u8 = 0x20;
const CALLCONV_EXPLICITTHIS: u8 = 0x40;
const CALLCONV_FIELD: u8 = 0x06;
const CALLCONV_LOCAL_SIG: u8 = 0x07;
const CALLCONV_GENERICINST: u8 = 0x0A;

/// Nesting limit for signature decoding.
const MAX_DEPTH: usize = 64;

/// A type as it appears in a signature.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    String,
    Object,
    IntPtr,
    UIntPtr,
    TypedReference,
    /// A reference type
    Class(TypeRef),
    /// A value type
    ValueType(TypeRef),
    /// A single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
    /// A general array
    Array {
        /// Element type
        element: Box<TypeSig>,
        /// Number of dimensions
        rank: u32,
        /// Declared sizes of the leading dimensions
        sizes: Vec<u32>,
        /// Declared lower bounds of the leading dimensions
        lower_bounds: Vec<i32>,
    },
    /// An unmanaged pointer
    Pointer(Box<TypeSig>),
    /// A managed reference (`ref`, `out`)
    ByRef(Box<TypeSig>),
    /// A pinned local
    Pinned(Box<TypeSig>),
    /// An instantiated generic type
    GenericInst {
        /// `true` for value types
        value_type: bool,
        /// The generic type definition
        base: TypeRef,
        /// Type arguments
        args: Vec<TypeSig>,
    },
    /// A generic parameter of the enclosing type
    Var(u32),
    /// A generic parameter of the enclosing method
    MVar(u32),
    /// A function pointer
    FnPtr(Box<MethodSig>),
    /// A type carrying a custom modifier
    Modified {
        /// `modreq` rather than `modopt`
        required: bool,
        /// The modifier type
        modifier: TypeRef,
        /// The modified type
        inner: Box<TypeSig>,
    },
}

impl TypeSig {
    /// Appends the encoded type to `buffer`, mapping class references to tokens via `types`.
    ///
    /// # Errors
    ///
    /// Propagates failures of `types`, typically an unresolved reference.
    pub fn encode(
        &self,
        buffer: &mut Vec<u8>,
        types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
    ) -> Result<()> {
        let element = match self {
            TypeSig::Void => ELEMENT_TYPE_VOID,
            TypeSig::Boolean => ELEMENT_TYPE_BOOLEAN,
            TypeSig::Char => ELEMENT_TYPE_CHAR,
            TypeSig::SByte => ELEMENT_TYPE_I1,
            TypeSig::Byte => ELEMENT_TYPE_U1,
            TypeSig::Int16 => ELEMENT_TYPE_I2,
            TypeSig::UInt16 => ELEMENT_TYPE_U2,
            TypeSig::Int32 => ELEMENT_TYPE_I4,
            TypeSig::UInt32 => ELEMENT_TYPE_U4,
            TypeSig::Int64 => ELEMENT_TYPE_I8,
            TypeSig::UInt64 => ELEMENT_TYPE_U8,
            TypeSig::Single => ELEMENT_TYPE_R4,
            TypeSig::Double => ELEMENT_TYPE_R8,
            TypeSig::String => ELEMENT_TYPE_STRING,
            TypeSig::Object => ELEMENT_TYPE_OBJECT,
            TypeSig::IntPtr => ELEMENT_TYPE_I,
            TypeSig::UIntPtr => ELEMENT_TYPE_U,
            TypeSig::TypedReference => ELEMENT_TYPE_TYPEDBYREF,
            TypeSig::Class(reference) => {
                buffer.push(ELEMENT_TYPE_CLASS);
                return write_type_token(buffer, reference, types);
            }
            TypeSig::ValueType(reference) => {
                buffer.push(ELEMENT_TYPE_VALUETYPE);
                return write_type_token(buffer, reference, types);
            }
            TypeSig::SzArray(element) => {
                buffer.push(ELEMENT_TYPE_SZARRAY);
                return element.encode(buffer, types);
            }
            TypeSig::Array {
                element,
                rank,
                sizes,
                lower_bounds,
            } => {
                buffer.push(ELEMENT_TYPE_ARRAY);
                element.encode(buffer, types)?;
                write_compressed_uint(buffer, *rank);
                write_count(buffer, sizes.len());
                for size in sizes {
                    write_compressed_uint(buffer, *size);
                }
                write_count(buffer, lower_bounds.len());
                for bound in lower_bounds {
                    write_compressed_int(buffer, *bound);
                }
                return Ok(());
            }
            TypeSig::Pointer(inner) | TypeSig::ByRef(inner) | TypeSig::Pinned(inner) => {
                buffer.push(match self {
                    TypeSig::Pointer(_) => ELEMENT_TYPE_PTR,
                    TypeSig::ByRef(_) => ELEMENT_TYPE_BYREF,
                    _ => ELEMENT_TYPE_PINNED,
                });
                return inner.encode(buffer, types);
            }
            TypeSig::GenericInst {
                value_type,
                base,
                args,
            } => {
                buffer.push(ELEMENT_TYPE_GENERICINST);
                buffer.push(if *value_type {
                    ELEMENT_TYPE_VALUETYPE
                } else {
                    ELEMENT_TYPE_CLASS
                });
                write_type_token(buffer, base, types)?;
                write_count(buffer, args.len());
                for arg in args {
                    arg.encode(buffer, types)?;
                }
                return Ok(());
            }
            TypeSig::Var(number) | TypeSig::MVar(number) => {
                buffer.push(if matches!(self, TypeSig::Var(_)) {
                    ELEMENT_TYPE_VAR
                } else {
                    ELEMENT_TYPE_MVAR
                });
                write_compressed_uint(buffer, *number);
                return Ok(());
            }
            TypeSig::FnPtr(signature) => {
                buffer.push(ELEMENT_TYPE_FNPTR);
                return signature.encode(buffer, types);
            }
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                buffer.push(if *required {
                    ELEMENT_TYPE_CMOD_REQD
                } else {
                    ELEMENT_TYPE_CMOD_OPT
                });
                write_type_token(buffer, modifier, types)?;
                return inner.encode(buffer, types);
            }
        };

        buffer.push(element);
        Ok(())
    }

    /// Decodes one type at the parser's position, mapping tokens back via `types`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for unknown element types and signatures nested
    /// deeper than the decoder allows.
    pub fn decode(parser: &mut Parser<'_>, types: &dyn Fn(Token) -> Result<TypeRef>) -> Result<Self> {
        Self::decode_nested(parser, types, 0)
    }

    fn decode_nested(
        parser: &mut Parser<'_>,
        types: &dyn Fn(Token) -> Result<TypeRef>,
        depth: usize,
    ) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(malformed_error!("Signature nested deeper than {}", MAX_DEPTH));
        }
        let inner = |parser: &mut Parser<'_>| {
            TypeSig::decode_nested(parser, types, depth + 1).map(Box::new)
        };

        let element = parser.read_le::<u8>()?;
        Ok(match element {
            ELEMENT_TYPE_VOID => TypeSig::Void,
            ELEMENT_TYPE_BOOLEAN => TypeSig::Boolean,
            ELEMENT_TYPE_CHAR => TypeSig::Char,
            ELEMENT_TYPE_I1 => TypeSig::SByte,
            ELEMENT_TYPE_U1 => TypeSig::Byte,
            ELEMENT_TYPE_I2 => TypeSig::Int16,
            ELEMENT_TYPE_U2 => TypeSig::UInt16,
            ELEMENT_TYPE_I4 => TypeSig::Int32,
            ELEMENT_TYPE_U4 => TypeSig::UInt32,
            ELEMENT_TYPE_I8 => TypeSig::Int64,
            ELEMENT_TYPE_U8 => TypeSig::UInt64,
            ELEMENT_TYPE_R4 => TypeSig::Single,
            ELEMENT_TYPE_R8 => TypeSig::Double,
            ELEMENT_TYPE_STRING => TypeSig::String,
            ELEMENT_TYPE_OBJECT => TypeSig::Object,
            ELEMENT_TYPE_I => TypeSig::IntPtr,
            ELEMENT_TYPE_U => TypeSig::UIntPtr,
            ELEMENT_TYPE_TYPEDBYREF => TypeSig::TypedReference,
            ELEMENT_TYPE_CLASS => TypeSig::Class(types(parser.read_compressed_token()?)?),
            ELEMENT_TYPE_VALUETYPE => TypeSig::ValueType(types(parser.read_compressed_token()?)?),
            ELEMENT_TYPE_SZARRAY => TypeSig::SzArray(inner(parser)?),
            ELEMENT_TYPE_PTR => TypeSig::Pointer(inner(parser)?),
            ELEMENT_TYPE_BYREF => TypeSig::ByRef(inner(parser)?),
            ELEMENT_TYPE_PINNED => TypeSig::Pinned(inner(parser)?),
            ELEMENT_TYPE_ARRAY => {
                let element = inner(parser)?;
                let rank = parser.read_compressed_uint()?;
                let size_count = parser.read_compressed_uint()?;
                let mut sizes = Vec::new();
                for _ in 0..size_count {
                    sizes.push(parser.read_compressed_uint()?);
                }
                let bound_count = parser.read_compressed_uint()?;
                let mut lower_bounds = Vec::new();
                for _ in 0..bound_count {
                    lower_bounds.push(read_compressed_int(parser)?);
                }
                TypeSig::Array {
                    element,
                    rank,
                    sizes,
                    lower_bounds,
                }
            }
            ELEMENT_TYPE_GENERICINST => {
                let value_type = match parser.read_le::<u8>()? {
                    ELEMENT_TYPE_CLASS => false,
                    ELEMENT_TYPE_VALUETYPE => true,
                    other => {
                        return Err(malformed_error!(
                            "Generic instantiation of element type 0x{:02X}",
                            other
                        ))
                    }
                };
                let base = types(parser.read_compressed_token()?)?;
                let count = parser.read_compressed_uint()?;
                let mut args = Vec::new();
                for _ in 0..count {
                    args.push(TypeSig::decode_nested(parser, types, depth + 1)?);
                }
                TypeSig::GenericInst {
                    value_type,
                    base,
                    args,
                }
            }
            ELEMENT_TYPE_VAR => TypeSig::Var(parser.read_compressed_uint()?),
            ELEMENT_TYPE_MVAR => TypeSig::MVar(parser.read_compressed_uint()?),
            ELEMENT_TYPE_FNPTR => {
                TypeSig::FnPtr(Box::new(MethodSig::decode(parser, types, depth + 1)?))
            }
            ELEMENT_TYPE_CMOD_REQD | ELEMENT_TYPE_CMOD_OPT => TypeSig::Modified {
                required: element == ELEMENT_TYPE_CMOD_REQD,
                modifier: types(parser.read_compressed_token()?)?,
                inner: inner(parser)?,
            },
            other => {
                return Err(malformed_error!(
                    "Unsupported element type 0x{:02X} in signature",
                    other
                ))
            }
        })
    }

    /// Every type reference this signature names, outermost first.
    #[must_use]
    pub fn type_refs(&self) -> Vec<&TypeRef> {
        let mut found = Vec::new();
        self.collect_type_refs(&mut found);
        found
    }

    fn collect_type_refs<'a>(&'a self, found: &mut Vec<&'a TypeRef>) {
        match self {
            TypeSig::Class(reference) | TypeSig::ValueType(reference) => found.push(reference),
            TypeSig::SzArray(inner)
            | TypeSig::Pointer(inner)
            | TypeSig::ByRef(inner)
            | TypeSig::Pinned(inner) => inner.collect_type_refs(found),
            TypeSig::Array { element, .. } => element.collect_type_refs(found),
            TypeSig::GenericInst { base, args, .. } => {
                found.push(base);
                args.iter().for_each(|arg| arg.collect_type_refs(found));
            }
            TypeSig::FnPtr(signature) => signature
                .types()
                .for_each(|signature| signature.collect_type_refs(found)),
            TypeSig::Modified {
                modifier, inner, ..
            } => {
                found.push(modifier);
                inner.collect_type_refs(found);
            }
            _ => {}
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeSig::Void => "System.Void",
            TypeSig::Boolean => "System.Boolean",
            TypeSig::Char => "System.Char",
            TypeSig::SByte => "System.SByte",
            TypeSig::Byte => "System.Byte",
            TypeSig::Int16 => "System.Int16",
            TypeSig::UInt16 => "System.UInt16",
            TypeSig::Int32 => "System.Int32",
            TypeSig::UInt32 => "System.UInt32",
            TypeSig::Int64 => "System.Int64",
            TypeSig::UInt64 => "System.UInt64",
            TypeSig::Single => "System.Single",
            TypeSig::Double => "System.Double",
            TypeSig::String => "System.String",
            TypeSig::Object => "System.Object",
            TypeSig::IntPtr => "System.IntPtr",
            TypeSig::UIntPtr => "System.UIntPtr",
            TypeSig::TypedReference => "System.TypedReference",
            TypeSig::Class(reference) | TypeSig::ValueType(reference) => {
                return f.write_str(&reference.full_name())
            }
            TypeSig::SzArray(element) => return write!(f, "{element}[]"),
            TypeSig::Array { element, rank, .. } => {
                let commas = ",".repeat((*rank as usize).saturating_sub(1));
                return write!(f, "{element}[{commas}]");
            }
            TypeSig::Pointer(inner) => return write!(f, "{inner}*"),
            TypeSig::ByRef(inner) => return write!(f, "{inner}&"),
            TypeSig::Pinned(inner) => return write!(f, "{inner} pinned"),
            TypeSig::GenericInst { base, args, .. } => {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                return write!(f, "{}<{}>", base.full_name(), args.join(","));
            }
            TypeSig::Var(number) => return write!(f, "!{number}"),
            TypeSig::MVar(number) => return write!(f, "!!{number}"),
            TypeSig::FnPtr(signature) => {
                return write!(
                    f,
                    "method {} *{}",
                    signature.return_type,
                    signature.parameter_list()
                )
            }
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                let kind = if *required { "modreq" } else { "modopt" };
                return write!(f, "{inner} {kind}({})", modifier.full_name());
            }
        };
        f.write_str(name)
    }
}

/// The unmanaged calling convention of a method signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// Managed default
    #[default]
    Default,
    /// `cdecl`
    C,
    /// `stdcall`
    StdCall,
    /// `thiscall`
    ThisCall,
    /// `fastcall`
    FastCall,
    /// Variable argument list
    VarArg,
}

impl CallingConvention {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => CallingConvention::Default,
            1 => CallingConvention::C,
            2 => CallingConvention::StdCall,
            3 => CallingConvention::ThisCall,
            4 => CallingConvention::FastCall,
            5 => CallingConvention::VarArg,
            _ => return None,
        })
    }

    fn bits(self) -> u8 {
        match self {
            CallingConvention::Default => 0,
            CallingConvention::C => 1,
            CallingConvention::StdCall => 2,
            CallingConvention::ThisCall => 3,
            CallingConvention::FastCall => 4,
            CallingConvention::VarArg => 5,
        }
    }
}

/// A method signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Instance method; argument 0 is `this`
    pub has_this: bool,
    /// `this` is passed explicitly as the first parameter
    pub explicit_this: bool,
    /// Calling convention
    pub calling_convention: CallingConvention,
    /// Number of generic parameters of a generic method
    pub generic_params: u32,
    /// The return type
    pub return_type: TypeSig,
    /// Declared parameter types, excluding `this`
    pub params: Vec<TypeSig>,
    /// Types passed after the sentinel of a vararg call site
    pub varargs: Vec<TypeSig>,
}

impl MethodSig {
    /// A static method signature.
    #[must_use]
    pub fn new_static(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: false,
            explicit_this: false,
            calling_convention: CallingConvention::Default,
            generic_params: 0,
            return_type,
            params,
            varargs: Vec::new(),
        }
    }

    /// An instance method signature.
    #[must_use]
    pub fn new_instance(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSig {
            has_this: true,
            ..MethodSig::new_static(return_type, params)
        }
    }

    /// The return type followed by every parameter type.
    pub fn types(&self) -> impl Iterator<Item = &TypeSig> {
        std::iter::once(&self.return_type)
            .chain(&self.params)
            .chain(&self.varargs)
    }

    fn encode(
        &self,
        buffer: &mut Vec<u8>,
        types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
    ) -> Result<()> {
        let mut convention = self.calling_convention.bits();
        if self.has_this {
            convention |= CALLCONV_HASTHIS;
        }
        if self.explicit_this {
            convention |= CALLCONV_EXPLICITTHIS;
        }
        if self.generic_params > 0 {
            convention |= CALLCONV_GENERIC;
        }
        buffer.push(convention);
        if self.generic_params > 0 {
            write_compressed_uint(buffer, self.generic_params);
        }

        write_count(buffer, self.params.len() + self.varargs.len());
        self.return_type.encode(buffer, types)?;
        for param in &self.params {
            param.encode(buffer, types)?;
        }
        if !self.varargs.is_empty() {
            buffer.push(ELEMENT_TYPE_SENTINEL);
            for param in &self.varargs {
                param.encode(buffer, types)?;
            }
        }
        Ok(())
    }

    fn decode(
        parser: &mut Parser<'_>,
        types: &dyn Fn(Token) -> Result<TypeRef>,
        depth: usize,
    ) -> Result<Self> {
        let convention = parser.read_le::<u8>()?;
        let Some(calling_convention) = CallingConvention::from_bits(convention & CALLCONV_MASK)
        else {
            return Err(malformed_error!(
                "Unsupported calling convention 0x{:02X}",
                convention
            ));
        };

        let generic_params = if convention & CALLCONV_GENERIC != 0 {
            parser.read_compressed_uint()?
        } else {
            0
        };
        let count = parser.read_compressed_uint()?;
        let return_type = TypeSig::decode_nested(parser, types, depth + 1)?;

        let mut params = Vec::new();
        let mut varargs = Vec::new();
        for _ in 0..count {
            if varargs.is_empty() && parser.peek_byte()? == ELEMENT_TYPE_SENTINEL {
                parser.advance_by(1)?;
                varargs.push(TypeSig::decode_nested(parser, types, depth + 1)?);
            } else if varargs.is_empty() {
                params.push(TypeSig::decode_nested(parser, types, depth + 1)?);
            } else {
                varargs.push(TypeSig::decode_nested(parser, types, depth + 1)?);
            }
        }

        Ok(MethodSig {
            has_this: convention & CALLCONV_HASTHIS != 0,
            explicit_this: convention & CALLCONV_EXPLICITTHIS != 0,
            calling_convention,
            generic_params,
            return_type,
            params,
            varargs,
        })
    }

    /// Encodes the signature into a standalone blob.
    ///
    /// # Errors
    ///
    /// Propagates failures of `types`.
    pub fn to_blob(&self, types: &mut dyn FnMut(&TypeRef) -> Result<Token>) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(4 + self.params.len());
        self.encode(&mut blob, types)?;
        Ok(blob)
    }

    /// Decodes a method signature blob.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for field, local, property and method
    /// instantiation blobs.
    pub fn from_blob(blob: &[u8], types: &dyn Fn(Token) -> Result<TypeRef>) -> Result<Self> {
        let mut parser = Parser::new(blob);
        MethodSig::decode(&mut parser, types, 0)
    }

    /// Cecil-style parameter list, e.g. `(System.Int32,System.Boolean)`.
    #[must_use]
    pub fn parameter_list(&self) -> String {
        let mut params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        if !self.varargs.is_empty() {
            params.push("...".to_string());
            params.extend(self.varargs.iter().map(ToString::to_string));
        }
        format!("({})", params.join(","))
    }
}

/// Encodes a field signature blob.
///
/// # Errors
///
/// Propagates failures of `types`.
pub fn field_sig_to_blob(
    field_type: &TypeSig,
    types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
) -> Result<Vec<u8>> {
    let mut blob = vec![CALLCONV_FIELD];
    field_type.encode(&mut blob, types)?;
    Ok(blob)
}

/// Decodes a field signature blob.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the blob is not a field signature.
pub fn field_sig_from_blob(blob: &[u8], types: &dyn Fn(Token) -> Result<TypeRef>) -> Result<TypeSig> {
    let mut parser = Parser::new(blob);
    let convention = parser.read_le::<u8>()?;
    if convention != CALLCONV_FIELD {
        return Err(malformed_error!(
            "Expected field signature, found 0x{:02X}",
            convention
        ));
    }
    TypeSig::decode(&mut parser, types)
}

/// Returns `true` if `blob` starts like a field signature.
#[must_use]
pub fn is_field_sig(blob: &[u8]) -> bool {
    blob.first() == Some(&CALLCONV_FIELD)
}

/// Returns `true` if `blob` starts like a local variable signature.
#[must_use]
pub fn is_local_sig(blob: &[u8]) -> bool {
    blob.first() == Some(&CALLCONV_LOCAL_SIG)
}

/// Encodes a local variable signature blob.
///
/// # Errors
///
/// Propagates failures of `types`.
pub fn local_sig_to_blob(
    locals: &[TypeSig],
    types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
) -> Result<Vec<u8>> {
    let mut blob = vec![CALLCONV_LOCAL_SIG];
    write_count(&mut blob, locals.len());
    for local in locals {
        local.encode(&mut blob, types)?;
    }
    Ok(blob)
}

/// Decodes a local variable signature blob.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the blob is not a local variable signature.
pub fn local_sig_from_blob(
    blob: &[u8],
    types: &dyn Fn(Token) -> Result<TypeRef>,
) -> Result<Vec<TypeSig>> {
    let mut parser = Parser::new(blob);
    let convention = parser.read_le::<u8>()?;
    if convention != CALLCONV_LOCAL_SIG {
        return Err(malformed_error!(
            "Expected local variable signature, found 0x{:02X}",
            convention
        ));
    }

    let count = parser.read_compressed_uint()?;
    let mut locals = Vec::new();
    for _ in 0..count {
        locals.push(TypeSig::decode(&mut parser, types)?);
    }
    Ok(locals)
}

/// Encodes the type arguments of a method instantiation (`MethodSpec` blob).
///
/// # Errors
///
/// Propagates failures of `types`.
pub fn instantiation_to_blob(
    args: &[TypeSig],
    types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
) -> Result<Vec<u8>> {
    let mut blob = vec![CALLCONV_GENERICINST];
    write_count(&mut blob, args.len());
    for arg in args {
        arg.encode(&mut blob, types)?;
    }
    Ok(blob)
}

/// Decodes the type arguments of a method instantiation.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the blob is not a method instantiation.
pub fn instantiation_from_blob(
    blob: &[u8],
    types: &dyn Fn(Token) -> Result<TypeRef>,
) -> Result<Vec<TypeSig>> {
    let mut parser = Parser::new(blob);
    let convention = parser.read_le::<u8>()?;
    if convention != CALLCONV_GENERICINST {
        return Err(malformed_error!(
            "Expected method instantiation, found 0x{:02X}",
            convention
        ));
    }

    let count = parser.read_compressed_uint()?;
    let mut args = Vec::new();
    for _ in 0..count {
        args.push(TypeSig::decode(&mut parser, types)?);
    }
    Ok(args)
}

/// Encodes a `TypeSpec` blob.
///
/// # Errors
///
/// Propagates failures of `types`.
pub fn type_spec_to_blob(
    signature: &TypeSig,
    types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    signature.encode(&mut blob, types)?;
    Ok(blob)
}

/// Decodes a `TypeSpec` blob.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for undecodable signatures.
pub fn type_spec_from_blob(blob: &[u8], types: &dyn Fn(Token) -> Result<TypeRef>) -> Result<TypeSig> {
    let mut parser = Parser::new(blob);
    TypeSig::decode(&mut parser, types)
}

pub(crate) fn encode_type_def_or_ref(token: Token) -> Result<u32> {
    let tag = match token.table() {
        table::TYPE_DEF => 0,
        table::TYPE_REF => 1,
        table::TYPE_SPEC => 2,
        other => {
            return Err(malformed_error!(
                "Token table 0x{:02X} cannot appear in a signature",
                other
            ))
        }
    };
    Ok((token.row() << 2) | tag)
}

fn write_type_token(
    buffer: &mut Vec<u8>,
    reference: &TypeRef,
    types: &mut dyn FnMut(&TypeRef) -> Result<Token>,
) -> Result<()> {
    let token = types(reference)?;
    write_compressed_uint(buffer, encode_type_def_or_ref(token)?);
    Ok(())
}

fn write_count(buffer: &mut Vec<u8>, count: usize) {
    #[allow(clippy::cast_possible_truncation)]
    write_compressed_uint(buffer, count as u32);
}

/// Signed compressed integer (II.23.2): the sign bit is rotated into bit 0.
fn read_compressed_int(parser: &mut Parser<'_>) -> Result<i32> {
    let width = match parser.peek_byte()? {
        byte if byte & 0x80 == 0 => 1,
        byte if byte & 0xC0 == 0x80 => 2,
        _ => 4,
    };
    let raw = parser.read_compressed_uint()?;
    #[allow(clippy::cast_possible_wrap)]
    let value = (raw >> 1) as i32;
    if raw & 1 == 0 {
        return Ok(value);
    }
    Ok(match width {
        1 => value - 0x40,
        2 => value - 0x2000,
        _ => value - 0x1000_0000,
    })
}

fn write_compressed_int(buffer: &mut Vec<u8>, value: i32) {
    let sign = u32::from(value < 0);
    #[allow(clippy::cast_sign_loss)]
    let bits = value as u32;
    let raw = if (-0x40..0x40).contains(&value) {
        ((bits & 0x3F) << 1) | sign
    } else if (-0x2000..0x2000).contains(&value) {
        ((bits & 0x1FFF) << 1) | sign
    } else {
        ((bits & 0x0FFF_FFFF) << 1) | sign
    };

    if (-0x40..0x40).contains(&value) || !(-0x2000..0x2000).contains(&value) {
        write_compressed_uint(buffer, raw);
    } else {
        // Two bytes even when the rotated value would fit into one.
        #[allow(clippy::cast_possible_truncation)]
        buffer.extend_from_slice(&[0x80 | (raw >> 8) as u8, raw as u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::references::ResolutionScope;

    fn item() -> TypeRef {
        TypeRef::new(ResolutionScope::Module, "Terraria", "Item")
    }

    fn list() -> TypeRef {
        TypeRef::new(
            ResolutionScope::Assembly("mscorlib".into()),
            "System.Collections.Generic",
            "List`1",
        )
    }

    fn to_token(reference: &TypeRef) -> Result<Token> {
        if reference == &list() {
            return Ok(Token::from_parts(table::TYPE_REF, 2));
        }
        assert_eq!(reference, &item());
        Ok(Token::from_parts(table::TYPE_DEF, 3))
    }

    fn from_token(token: Token) -> Result<TypeRef> {
        if token == Token::from_parts(table::TYPE_REF, 2) {
            return Ok(list());
        }
        assert_eq!(token, Token::from_parts(table::TYPE_DEF, 3));
        Ok(item())
    }

    #[test]
    fn test_method_sig_blob() {
        let sig = MethodSig::new_static(TypeSig::Void, vec![TypeSig::Class(item())]);
        let blob = sig.to_blob(&mut to_token).unwrap();
        assert_eq!(blob, [0x00, 0x01, 0x01, 0x12, 0x0C]);

        let parsed = MethodSig::from_blob(&blob, &from_token).unwrap();
        assert_eq!(parsed, sig);
        assert_eq!(parsed.parameter_list(), "(Terraria.Item)");
    }

    #[test]
    fn test_instance_sig_blob() {
        let sig = MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Int32, TypeSig::Boolean]);
        let blob = sig.to_blob(&mut to_token).unwrap();
        assert_eq!(blob, [0x20, 0x02, 0x01, 0x08, 0x02]);
    }

    #[test]
    fn test_generic_method_sig() {
        // static !!0 Pick<T>(class List`1<!!0>, int32&)
        let blob = [0x10, 0x01, 0x02, 0x1E, 0x00, 0x15, 0x12, 0x09, 0x01, 0x1E, 0x00, 0x10, 0x08];
        let sig = MethodSig::from_blob(&blob, &from_token).unwrap();
        assert_eq!(sig.generic_params, 1);
        assert_eq!(sig.return_type, TypeSig::MVar(0));
        assert_eq!(
            sig.params[0],
            TypeSig::GenericInst {
                value_type: false,
                base: list(),
                args: vec![TypeSig::MVar(0)],
            }
        );
        assert_eq!(sig.params[1], TypeSig::ByRef(Box::new(TypeSig::Int32)));
        assert_eq!(
            sig.parameter_list(),
            "(System.Collections.Generic.List`1<!!0>,System.Int32&)"
        );
        assert_eq!(sig.to_blob(&mut to_token).unwrap(), blob);
    }

    #[test]
    fn test_vararg_call_site() {
        let blob = [0x05, 0x02, 0x01, 0x0E, 0x41, 0x08];
        let sig = MethodSig::from_blob(&blob, &from_token).unwrap();
        assert_eq!(sig.calling_convention, CallingConvention::VarArg);
        assert_eq!(sig.params, vec![TypeSig::String]);
        assert_eq!(sig.varargs, vec![TypeSig::Int32]);
        assert_eq!(sig.to_blob(&mut to_token).unwrap(), blob);
    }

    #[test]
    fn test_field_and_local_sigs() {
        let blob = field_sig_to_blob(&TypeSig::Boolean, &mut to_token).unwrap();
        assert_eq!(blob, [0x06, 0x02]);
        assert!(is_field_sig(&blob));
        assert_eq!(field_sig_from_blob(&blob, &from_token).unwrap(), TypeSig::Boolean);

        let locals = vec![TypeSig::Int32, TypeSig::SzArray(Box::new(TypeSig::String))];
        let blob = local_sig_to_blob(&locals, &mut to_token).unwrap();
        assert_eq!(blob, [0x07, 0x02, 0x08, 0x1D, 0x0E]);
        assert!(is_local_sig(&blob));
        assert_eq!(local_sig_from_blob(&blob, &from_token).unwrap(), locals);

        let pinned = [0x07, 0x01, 0x45, 0x10, 0x05];
        assert_eq!(
            local_sig_from_blob(&pinned, &from_token).unwrap(),
            vec![TypeSig::Pinned(Box::new(TypeSig::ByRef(Box::new(TypeSig::Byte))))]
        );
    }

    #[test]
    fn test_array_and_modifiers() {
        // int32[0...,-2...] modreq(Item)
        let blob = [0x1F, 0x0C, 0x14, 0x08, 0x02, 0x00, 0x02, 0x00, 0x7D];
        let sig = type_spec_from_blob(&blob, &from_token).unwrap();
        let TypeSig::Modified { required, inner, .. } = &sig else {
            panic!("expected a modifier, got {sig:?}");
        };
        assert!(*required);
        assert_eq!(
            **inner,
            TypeSig::Array {
                element: Box::new(TypeSig::Int32),
                rank: 2,
                sizes: vec![],
                lower_bounds: vec![0, -2],
            }
        );
        assert_eq!(sig.to_string(), "System.Int32[,] modreq(Terraria.Item)");
        assert_eq!(type_spec_to_blob(&sig, &mut to_token).unwrap(), blob);
    }

    #[test]
    fn test_compressed_int() {
        for value in [0, 1, -1, 63, -64, 64, -65, 0x1FFF, -0x2000, 0x2000, -0x2001, 0x0FFF_FFFF] {
            let mut buffer = Vec::new();
            write_compressed_int(&mut buffer, value);
            let mut parser = Parser::new(&buffer);
            assert_eq!(read_compressed_int(&mut parser).unwrap(), value, "{buffer:02X?}");
        }

        // Examples from ECMA-335 II.23.2
        let mut buffer = Vec::new();
        write_compressed_int(&mut buffer, -3);
        assert_eq!(buffer, [0x7B]);
        let mut buffer = Vec::new();
        write_compressed_int(&mut buffer, -8192);
        assert_eq!(buffer, [0x80, 0x01]);
    }

    #[test]
    fn test_instantiation_blob() {
        let args = vec![TypeSig::Int32, TypeSig::Class(item())];
        let blob = instantiation_to_blob(&args, &mut to_token).unwrap();
        assert_eq!(blob, [0x0A, 0x02, 0x08, 0x12, 0x0C]);
        assert_eq!(instantiation_from_blob(&blob, &from_token).unwrap(), args);
        assert!(instantiation_from_blob(&[0x06, 0x00], &from_token).is_err());
    }

    #[test]
    fn test_unsupported_element() {
        let blob = [0x06, 0x17];
        assert!(field_sig_from_blob(&blob, &from_token).is_err());
        assert!(MethodSig::from_blob(&[0x06, 0x00, 0x01], &from_token).is_err());
        assert!(MethodSig::from_blob(&[0x07, 0x00, 0x01], &from_token).is_err());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(TypeSig::Int32.to_string(), "System.Int32");
        assert_eq!(
            TypeSig::SzArray(Box::new(TypeSig::Class(item()))).to_string(),
            "Terraria.Item[]"
        );
        assert_eq!(TypeSig::Pointer(Box::new(TypeSig::Byte)).to_string(), "System.Byte*");
        assert_eq!(TypeSig::Var(1).to_string(), "!1");
    }
}
