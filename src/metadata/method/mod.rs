//! Method definitions and their bodies.
//!
//! # Key Components
//!
//! - [`MethodDef`] - A method defined in the module, with its signature and optional body
//! - [`MethodBody`] - The editable instruction list, locals and exception clauses
//! - [`ExceptionHandler`] - A try/catch/finally/fault clause anchored on instruction ids
//! - [`MethodAttributes`] / [`MethodImplAttributes`] / [`ParamAttributes`] - Definition flags
//!
//! Bodies of loaded methods are only re-encoded once they have been touched through
//! [`MethodDef::body_mut`] or replaced with [`MethodDef::set_body`]; every other method keeps
//! its original bytes.

mod body;
mod exceptions;
mod types;

pub use body::{BodyEmitter, BodyResolver, MethodBody};
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags};
pub use types::*;

use crate::metadata::{
    references::{MethodRef, TypeRef},
    signatures::MethodSig,
    token::{table, Token},
};

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter flags
    pub flags: ParamAttributes,
    /// 1-based position in the signature, 0 for the return value
    pub sequence: u16,
    /// Declared name
    pub name: String,
    pub(crate) row: Option<u32>,
}

impl Parameter {
    /// A parameter without flags.
    #[must_use]
    pub fn new(sequence: u16, name: impl Into<String>) -> Self {
        Parameter {
            flags: ParamAttributes::empty(),
            sequence,
            name: name.into(),
            row: None,
        }
    }
}

/// The `MethodDef` row a loaded method was read from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MethodOrigin {
    pub(crate) row: u32,
    pub(crate) signature: MethodSig,
    pub(crate) rva: u32,
}

/// A method defined in the module.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Definition flags
    pub flags: MethodAttributes,
    /// Implementation flags
    pub impl_flags: MethodImplAttributes,
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: MethodSig,
    /// Declared parameters
    pub parameters: Vec<Parameter>,
    body: Option<MethodBody>,
    pub(crate) origin: Option<MethodOrigin>,
    dirty: bool,
}

impl MethodDef {
    /// A method without parameters names or body.
    #[must_use]
    pub fn new(flags: MethodAttributes, name: impl Into<String>, signature: MethodSig) -> Self {
        MethodDef {
            flags,
            impl_flags: MethodImplAttributes::empty(),
            name: name.into(),
            signature,
            parameters: Vec::new(),
            body: None,
            origin: None,
            dirty: false,
        }
    }

    /// Declares parameter names.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attaches a body.
    #[must_use]
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.set_body(Some(body));
        self
    }

    pub(crate) fn loaded(
        mut self,
        origin: MethodOrigin,
        body: Option<MethodBody>,
    ) -> Self {
        self.origin = Some(origin);
        self.body = body;
        self.dirty = false;
        self
    }

    /// The body; `None` for abstract, runtime and extern methods, and for loaded bodies that
    /// could not be decoded.
    #[must_use]
    pub fn body(&self) -> Option<&MethodBody> {
        self.body.as_ref()
    }

    /// Mutable access to the body. The body is re-encoded when the model is written.
    pub fn body_mut(&mut self) -> Option<&mut MethodBody> {
        if self.body.is_some() {
            self.dirty = true;
        }
        self.body.as_mut()
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: Option<MethodBody>) {
        self.body = body;
        self.dirty = true;
    }

    /// Returns `true` if the body must be encoded on write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.origin.is_none()
    }

    /// Number of declared parameters, excluding `this`.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.signature.params.len()
    }

    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// A reference to this method as declared by `declaring_type`.
    #[must_use]
    pub fn reference(&self, declaring_type: TypeRef) -> MethodRef {
        let reference = MethodRef::new(declaring_type, self.name.clone(), self.signature.clone());
        match &self.origin {
            Some(origin) => reference.with_token(Token::from_parts(table::METHOD_DEF, origin.row)),
            None => reference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{OpCode, Operand},
        metadata::signatures::TypeSig,
    };

    fn ret_body() -> MethodBody {
        let mut body = MethodBody::new();
        body.instructions = vec![body.create(OpCode::Ret, Operand::None)];
        body
    }

    #[test]
    fn test_dirty_tracking() {
        let method = MethodDef::new(
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            "LoadPlayers",
            MethodSig::new_static(TypeSig::Void, vec![]),
        );
        let origin = MethodOrigin {
            row: 3,
            signature: method.signature.clone(),
            rva: 0x2050,
        };
        let mut method = method.loaded(origin, Some(ret_body()));
        assert!(!method.is_dirty());
        assert!(method.body().is_some());
        assert!(!method.is_dirty());

        method.body_mut().unwrap().instructions.clear();
        assert!(method.is_dirty());
        assert_eq!(
            method.reference(TypeRef::new(crate::metadata::references::ResolutionScope::Module, "Terraria", "Main")).token(),
            Some(Token::new(0x0600_0003))
        );
    }

    #[test]
    fn test_new_method_is_dirty() {
        let method = MethodDef::new(
            MethodAttributes::PUBLIC,
            "SetDefaults",
            MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Int32]),
        )
        .with_parameters(vec![Parameter::new(1, "type")])
        .with_body(ret_body());
        assert!(method.is_dirty());
        assert_eq!(method.parameter_count(), 1);
        assert!(!method.is_static());
        assert_eq!(method.parameters[0].name, "type");
    }
}
