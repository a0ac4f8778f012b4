//! By-value references to types, fields, methods and assemblies.
//!
//! Instruction operands carry these instead of raw tokens, so code can be moved between
//! methods, compared and printed without a live module. Equality is structural: two
//! [`MethodRef`]s are equal when they name the same declaring type, name, signature and
//! instantiation. References produced by the loader also remember the token they were read
//! from; the token is ignored by equality and hashing, and the writer prefers it when the row
//! behind it still describes the same member.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use crate::metadata::{
    signatures::{MethodSig, TypeSig},
    token::Token,
};

/// A four-part assembly version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl Version {
    /// Creates a version from its four parts.
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Version {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// A referenced assembly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssemblyRef {
    /// Simple name, e.g. `ItemModification`
    pub name: String,
    /// Referenced version
    pub version: Version,
}

impl AssemblyRef {
    /// Creates an assembly reference.
    #[must_use]
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        AssemblyRef {
            name: name.into(),
            version,
        }
    }
}

/// Where a referenced type is defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolutionScope {
    /// Defined in the module being patched
    Module,
    /// Defined in the named referenced assembly
    Assembly(String),
    /// Defined in the named module of this assembly, or a native library for P/Invoke
    ModuleRef(String),
    /// Nested inside the given type
    Nested(Box<TypeRef>),
}

/// A reference to a type by scope and name.
#[derive(Debug, Clone)]
pub struct TypeRef {
    /// Where the type lives
    pub scope: ResolutionScope,
    /// Namespace, empty for the global namespace and for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// `TypeDef`, `TypeRef` or `TypeSpec` token the loader read this reference from
    pub(crate) token: Option<Token>,
}

impl TypeRef {
    /// Creates a type reference.
    #[must_use]
    pub fn new(scope: ResolutionScope, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        TypeRef {
            scope,
            namespace: namespace.into(),
            name: name.into(),
            token: None,
        }
    }

    /// A type nested inside `outer`.
    #[must_use]
    pub fn nested(outer: TypeRef, name: impl Into<String>) -> Self {
        TypeRef::new(ResolutionScope::Nested(Box::new(outer)), "", name)
    }

    pub(crate) fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// The token this reference was loaded from, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// `Namespace.Name`, or just `Name` in the global namespace. Nested types are written
    /// `Outer/Inner`.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.scope {
            ResolutionScope::Nested(outer) => {
                format!("{}/{}", outer.full_name(), full_type_name(&self.namespace, &self.name))
            }
            _ => full_type_name(&self.namespace, &self.name),
        }
    }

    /// Returns `true` if the type lives in the module being patched.
    #[must_use]
    pub fn is_local(&self) -> bool {
        match &self.scope {
            ResolutionScope::Module => true,
            ResolutionScope::Nested(outer) => outer.is_local(),
            ResolutionScope::Assembly(_) | ResolutionScope::ModuleRef(_) => false,
        }
    }

    /// The scope of the outermost enclosing type.
    #[must_use]
    pub fn root_scope(&self) -> &ResolutionScope {
        match &self.scope {
            ResolutionScope::Nested(outer) => outer.root_scope(),
            scope => scope,
        }
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.scope == other.scope && self.namespace == other.namespace && self.name == other.name
    }
}

impl Eq for TypeRef {}

impl Hash for TypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scope.hash(state);
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root_scope() {
            ResolutionScope::Assembly(assembly) => write!(f, "[{assembly}]{}", self.full_name()),
            ResolutionScope::ModuleRef(module) => write!(f, "[.module {module}]{}", self.full_name()),
            _ => f.write_str(&self.full_name()),
        }
    }
}

/// A reference to a field.
#[derive(Debug, Clone)]
pub struct FieldRef {
    /// The type declaring the field
    pub declaring_type: TypeRef,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeSig,
    pub(crate) token: Option<Token>,
}

impl FieldRef {
    /// Creates a field reference.
    #[must_use]
    pub fn new(declaring_type: TypeRef, name: impl Into<String>, field_type: TypeSig) -> Self {
        FieldRef {
            declaring_type,
            name: name.into(),
            field_type,
            token: None,
        }
    }

    pub(crate) fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// The `Field` or `MemberRef` token this reference was loaded from, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// `FieldType Namespace.Type::Name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!(
            "{} {}::{}",
            self.field_type,
            self.declaring_type.full_name(),
            self.name
        )
    }
}

impl PartialEq for FieldRef {
    fn eq(&self, other: &Self) -> bool {
        self.declaring_type == other.declaring_type
            && self.name == other.name
            && self.field_type == other.field_type
    }
}

impl Eq for FieldRef {}

impl Hash for FieldRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.declaring_type.hash(state);
        self.name.hash(state);
        self.field_type.hash(state);
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// A reference to a method, or to an instantiation of a generic method.
#[derive(Debug, Clone)]
pub struct MethodRef {
    /// The type declaring the method
    pub declaring_type: TypeRef,
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: MethodSig,
    /// Type arguments of a generic method instantiation; empty otherwise
    pub instantiation: Vec<TypeSig>,
    pub(crate) token: Option<Token>,
}

impl MethodRef {
    /// Creates a method reference.
    #[must_use]
    pub fn new(declaring_type: TypeRef, name: impl Into<String>, signature: MethodSig) -> Self {
        MethodRef {
            declaring_type,
            name: name.into(),
            signature,
            instantiation: Vec::new(),
            token: None,
        }
    }

    /// Instantiates this generic method with `args`.
    #[must_use]
    pub fn instantiate(mut self, args: Vec<TypeSig>) -> Self {
        self.instantiation = args;
        self.token = None;
        self
    }

    /// The uninstantiated method.
    #[must_use]
    pub fn generic_method(&self) -> MethodRef {
        MethodRef {
            instantiation: Vec::new(),
            token: None,
            ..self.clone()
        }
    }

    pub(crate) fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// The `MethodDef`, `MemberRef` or `MethodSpec` token this reference was loaded from,
    /// if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// `ReturnType Namespace.Type::Name<Args>(ParamType,...)`
    #[must_use]
    pub fn full_name(&self) -> String {
        let instantiation = if self.instantiation.is_empty() {
            String::new()
        } else {
            let args: Vec<String> = self.instantiation.iter().map(ToString::to_string).collect();
            format!("<{}>", args.join(","))
        };
        format!(
            "{} {}::{}{}{}",
            self.signature.return_type,
            self.declaring_type.full_name(),
            self.name,
            instantiation,
            self.signature.parameter_list()
        )
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        self.declaring_type == other.declaring_type
            && self.name == other.name
            && self.signature == other.signature
            && self.instantiation == other.instantiation
    }
}

impl Eq for MethodRef {}

impl Hash for MethodRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.declaring_type.hash(state);
        self.name.hash(state);
        self.signature.hash(state);
        self.instantiation.hash(state);
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// A row of the member reference table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberRef {
    /// An external field
    Field(FieldRef),
    /// An external method
    Method(MethodRef),
}

impl MemberRef {
    /// The declaring type of the referenced member.
    #[must_use]
    pub fn declaring_type(&self) -> &TypeRef {
        match self {
            MemberRef::Field(field) => &field.declaring_type,
            MemberRef::Method(method) => &method.declaring_type,
        }
    }
}

/// A method living in another assembly, described well enough to import it.
///
/// The patcher uses this to name the helper-library entry points it injects calls to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalMethod {
    /// The assembly defining the method
    pub assembly: AssemblyRef,
    /// Namespace of the declaring type
    pub namespace: String,
    /// Simple name of the declaring type
    pub type_name: String,
    /// Method name
    pub name: String,
    /// Method signature; class types of the target module use [`ResolutionScope::Module`]
    pub signature: MethodSig,
}

impl ExternalMethod {
    /// The declaring type, scoped to [`ExternalMethod::assembly`].
    #[must_use]
    pub fn declaring_type(&self) -> TypeRef {
        TypeRef::new(
            ResolutionScope::Assembly(self.assembly.name.clone()),
            self.namespace.clone(),
            self.type_name.clone(),
        )
    }

    /// The method reference instructions use to call this method.
    #[must_use]
    pub fn reference(&self) -> MethodRef {
        MethodRef::new(self.declaring_type(), self.name.clone(), self.signature.clone())
    }
}

impl fmt::Display for ExternalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.assembly.name, self.reference().full_name())
    }
}

pub(crate) fn full_type_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_full_name() {
        let method = MethodRef::new(
            TypeRef::new(
                ResolutionScope::Assembly("ItemModification".into()),
                "ItemModification",
                "ItemModifier",
            ),
            "OnSetItemDefaults",
            MethodSig::new_static(
                TypeSig::Void,
                vec![TypeSig::Class(TypeRef::new(ResolutionScope::Module, "Terraria", "Item"))],
            ),
        );
        assert_eq!(
            method.full_name(),
            "System.Void ItemModification.ItemModifier::OnSetItemDefaults(Terraria.Item)"
        );
        assert_eq!(
            method.declaring_type.to_string(),
            "[ItemModification]ItemModification.ItemModifier"
        );
    }

    #[test]
    fn test_field_full_name() {
        let field = FieldRef::new(
            TypeRef::new(ResolutionScope::Module, "", "Main"),
            "ItemModificationPatched",
            TypeSig::Boolean,
        );
        assert_eq!(field.full_name(), "System.Boolean Main::ItemModificationPatched");
    }

    #[test]
    fn test_token_ignored_by_equality() {
        let main = TypeRef::new(ResolutionScope::Module, "Terraria", "Main");
        let loaded = main.clone().with_token(Token::from_parts(0x02, 7));
        assert_eq!(main, loaded);
        assert_eq!(loaded.token(), Some(Token::new(0x0200_0007)));

        let mut hashes = std::collections::HashSet::new();
        hashes.insert(main);
        assert!(hashes.contains(&loaded));
    }

    #[test]
    fn test_nested_scope() {
        let outer = TypeRef::new(ResolutionScope::Assembly("mscorlib".into()), "System", "Environment");
        let inner = TypeRef::nested(outer, "SpecialFolder");
        assert_eq!(inner.full_name(), "System.Environment/SpecialFolder");
        assert_eq!(inner.to_string(), "[mscorlib]System.Environment/SpecialFolder");
        assert!(!inner.is_local());

        let local = TypeRef::nested(TypeRef::new(ResolutionScope::Module, "Terraria", "Main"), "<>c");
        assert!(local.is_local());
    }

    #[test]
    fn test_generic_instantiation() {
        let array = TypeRef::new(ResolutionScope::Assembly("mscorlib".into()), "System", "Array");
        let sig = MethodSig {
            generic_params: 1,
            ..MethodSig::new_static(
                TypeSig::SzArray(Box::new(TypeSig::MVar(0))),
                vec![],
            )
        };
        let empty = MethodRef::new(array, "Empty", sig);
        let of_int = empty.clone().instantiate(vec![TypeSig::Int32]);
        assert_ne!(empty, of_int);
        assert_eq!(of_int.generic_method(), empty);
        assert_eq!(of_int.full_name(), "!!0[] System.Array::Empty<System.Int32>()");
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(1, 3, 5, 3) > Version::new(1, 3, 5, 2));
        assert!(Version::new(1, 4, 0, 0) > Version::new(1, 3, 9, 9));
        assert_eq!(Version::new(1, 3, 5, 3).to_string(), "1.3.5.3");
    }
}
