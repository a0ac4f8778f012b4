//! Type and field definitions.
//!
//! Definitions read from an image remember the row they came from. The writer uses it to keep
//! the original row's columns for everything the model does not describe.

use bitflags::bitflags;

use crate::metadata::{
    method::MethodDef,
    references::{full_type_name, FieldRef, ResolutionScope, TypeRef},
    signatures::TypeSig,
    token::{table, Token},
};

bitflags! {
    /// Type definition attributes (ECMA-335 II.23.1.15).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeAttributes: u32 {
        /// Class is public scope
        const PUBLIC = 0x0000_0001;
        /// Class is nested with public visibility
        const NESTED_PUBLIC = 0x0000_0002;
        /// Fields are laid out sequentially
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Layout is supplied explicitly
        const EXPLICIT_LAYOUT = 0x0000_0010;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Class is abstract
        const ABSTRACT = 0x0000_0080;
        /// Class cannot be extended
        const SEALED = 0x0000_0100;
        /// Class name is special
        const SPECIAL_NAME = 0x0000_0400;
        /// Class is serializable
        const SERIALIZABLE = 0x0000_2000;
        /// Initialize the class before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    /// Field definition attributes (ECMA-335 II.23.1.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldAttributes: u16 {
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by sub-types only in this assembly
        const FAM_AND_ASSEM = 0x0002;
        /// Accessible by anyone in the assembly
        const ASSEMBLY = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by sub-types anywhere, plus anyone in assembly
        const FAM_OR_ASSEM = 0x0005;
        /// Accessible by anyone who has visibility to this scope
        const PUBLIC = 0x0006;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field can only be initialized, not written to after init
        const INIT_ONLY = 0x0020;
        /// Value is a compile time constant
        const LITERAL = 0x0040;
        /// Field does not have to be serialized when type is remoted
        const NOT_SERIALIZED = 0x0080;
        /// Field is special
        const SPECIAL_NAME = 0x0200;
    }
}

/// The `Field` row a loaded field was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldOrigin {
    pub(crate) row: u32,
    pub(crate) field_type: TypeSig,
}

/// A field defined in the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Definition flags
    pub flags: FieldAttributes,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeSig,
    pub(crate) origin: Option<FieldOrigin>,
}

impl FieldDef {
    /// Creates a field definition.
    #[must_use]
    pub fn new(flags: FieldAttributes, name: impl Into<String>, field_type: TypeSig) -> Self {
        FieldDef {
            flags,
            name: name.into(),
            field_type,
            origin: None,
        }
    }

    /// A reference to this field as declared by `declaring_type`.
    #[must_use]
    pub fn reference(&self, declaring_type: TypeRef) -> FieldRef {
        let reference = FieldRef::new(declaring_type, self.name.clone(), self.field_type.clone());
        match &self.origin {
            Some(origin) => reference.with_token(Token::from_parts(table::FIELD, origin.row)),
            None => reference,
        }
    }

    /// Returns `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }
}

/// Name of the pseudo type holding global fields and methods.
pub const MODULE_TYPE_NAME: &str = "<Module>";

/// A type defined in the module.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// Definition flags
    pub flags: TypeAttributes,
    /// Namespace, empty for the global namespace and for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// The enclosing type of a nested type
    pub declaring_type: Option<TypeRef>,
    /// Fields, in declaration order
    pub fields: Vec<FieldDef>,
    /// Methods, in declaration order
    pub methods: Vec<MethodDef>,
    /// The `TypeDef` row a loaded type was read from
    pub(crate) row: Option<u32>,
}

impl TypeDef {
    /// Creates an empty type definition.
    #[must_use]
    pub fn new(flags: TypeAttributes, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        TypeDef {
            flags,
            namespace: namespace.into(),
            name: name.into(),
            declaring_type: None,
            fields: Vec::new(),
            methods: Vec::new(),
            row: None,
        }
    }

    /// The `<Module>` pseudo type every module starts with.
    #[must_use]
    pub fn module() -> Self {
        TypeDef::new(TypeAttributes::empty(), "", MODULE_TYPE_NAME)
    }

    /// `Namespace.Name`, or just `Name` in the global namespace. Nested types are written
    /// `Outer/Inner`.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.declaring_type {
            Some(outer) => format!("{}/{}", outer.full_name(), full_type_name(&self.namespace, &self.name)),
            None => full_type_name(&self.namespace, &self.name),
        }
    }

    /// Returns `true` if `name` is either the simple or the full name of this type.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name == name || self.full_name() == name
    }

    /// Returns `true` for nested types.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.declaring_type.is_some()
    }

    /// A module-scoped reference to this type.
    #[must_use]
    pub fn reference(&self) -> TypeRef {
        let scope = match &self.declaring_type {
            Some(outer) => ResolutionScope::Nested(Box::new(outer.clone())),
            None => ResolutionScope::Module,
        };
        let reference = TypeRef::new(scope, self.namespace.clone(), self.name.clone());
        match self.row {
            Some(row) => reference.with_token(Token::from_parts(table::TYPE_DEF, row)),
            None => reference,
        }
    }

    /// A reference to the field called `name`.
    #[must_use]
    pub fn field_ref(&self, name: &str) -> Option<FieldRef> {
        Some(self.field(name)?.reference(self.reference()))
    }

    /// The field called `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Methods called `name`, in declaration order.
    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodDef> + 'a {
        self.methods.iter().filter(move |method| method.name == name)
    }
}
