//! The in-memory model of one managed binary.
//!
//! [`BinaryModel`] is what the loader produces and the writer consumes: the assembly identity,
//! the reference tables, and every type with its fields and methods. Lookups by name fail with
//! [`Error::DefinitionNotFound`], which is how a patch run notices that the target is a version
//! it was not written for. The `import_*` methods add the reference rows injected instructions
//! need to call into another assembly.
//!
//! A loaded model remembers the image it came from. Reference rows are only ever appended.
//! Loaded types, fields, methods and parameters must stay in their loaded order; new fields,
//! methods and parameters may be inserted anywhere, new types only after the loaded ones.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilpatch::metadata::model::BinaryModel;
//!
//! let mut model = BinaryModel::load("Terraria.exe")?;
//! let load_players = model.method("Main", "LoadPlayers", 0)?;
//! println!("{}", load_players.body().map(|b| b.listing()).unwrap_or_default());
//! model.write("Terraria.exe")?;
//! # Ok::<(), cilpatch::Error>(())
//! ```

use std::{fs, io::Write, path::Path, sync::Arc};

use crate::{
    file::File,
    metadata::{
        loader::{self, ModuleImage},
        method::MethodDef,
        references::{
            AssemblyRef, ExternalMethod, FieldRef, MemberRef, MethodRef, ResolutionScope, TypeRef,
            Version,
        },
        signatures::{MethodSig, TypeSig},
        typedef::{FieldAttributes, FieldDef, TypeDef},
        writer,
    },
    DefinitionKind, Error, Result,
};

/// A row of the standalone signature table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StandAloneSig {
    /// Local variable types of a method body
    Locals(Vec<TypeSig>),
    /// Call site signature of a `calli`
    Method(MethodSig),
}

/// A loaded (or freshly built) managed binary.
#[derive(Debug, Clone)]
pub struct BinaryModel {
    /// Assembly name
    pub name: String,
    /// Assembly version
    pub version: Version,
    /// Type definitions, `<Module>` first
    pub types: Vec<TypeDef>,
    assembly_refs: Vec<AssemblyRef>,
    type_refs: Vec<TypeRef>,
    /// One entry per `MemberRef` row; `None` for rows whose signature did not decode
    member_refs: Vec<Option<MemberRef>>,
    pub(crate) image: Option<Arc<ModuleImage>>,
}

impl BinaryModel {
    /// Creates a model holding only the `<Module>` type; writing it produces a fresh
    /// single-section image.
    #[must_use]
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        BinaryModel {
            name: name.into(),
            version,
            types: vec![TypeDef::module()],
            assembly_refs: Vec::new(),
            type_refs: Vec::new(),
            member_refs: Vec::new(),
            image: None,
        }
    }

    pub(crate) fn from_parts(
        name: String,
        version: Version,
        types: Vec<TypeDef>,
        assembly_refs: Vec<AssemblyRef>,
        type_refs: Vec<TypeRef>,
        member_refs: Vec<Option<MemberRef>>,
        image: Arc<ModuleImage>,
    ) -> Self {
        BinaryModel {
            name,
            version,
            types,
            assembly_refs,
            type_refs,
            member_refs,
            image: Some(image),
        }
    }

    /// Loads the binary at `path`.
    ///
    /// The file is memory-mapped only for the duration of this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be read, [`Error::BinaryFormat`] if it is
    /// not a PE image with a CLR header and metadata, and [`Error::Malformed`] for corrupt
    /// metadata.
    pub fn load(path: impl AsRef<Path>) -> Result<BinaryModel> {
        let path = path.as_ref();
        log::debug!("Loading {}", path.display());
        loader::load(File::from_file(path)?)
    }

    /// Loads a binary held in memory.
    ///
    /// # Errors
    ///
    /// See [`BinaryModel::load`].
    pub fn from_mem(data: Vec<u8>) -> Result<BinaryModel> {
        loader::load(File::from_mem(data)?)
    }

    /// Returns `true` if the model was loaded from an existing image.
    #[must_use]
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Serializes the model into a complete image.
    ///
    /// A loaded model keeps every byte of its image and appends one section holding the
    /// rewritten metadata and touched bodies; an unchanged model is returned as loaded. A new
    /// model is wrapped by [`crate::file::builder::ImageBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] / [`Error::UnresolvedReference`] if an instruction
    /// refers to something the model does not contain, and [`Error::Unsupported`] if loaded
    /// definitions were removed or reordered.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        writer::write(self)
    }

    /// Writes the model to `path`.
    ///
    /// The file is flushed, synced and closed before this returns. The write is not atomic.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`BinaryModel::to_bytes`] and [`Error::FileError`] for I/O
    /// failures.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;

        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Referenced assemblies, in row order.
    #[must_use]
    pub fn assembly_refs(&self) -> &[AssemblyRef] {
        &self.assembly_refs
    }

    /// Referenced types, in row order.
    #[must_use]
    pub fn type_refs(&self) -> &[TypeRef] {
        &self.type_refs
    }

    /// Referenced fields and methods whose signatures could be read.
    pub fn member_refs(&self) -> impl Iterator<Item = &MemberRef> {
        self.member_refs.iter().flatten()
    }

    pub(crate) fn member_ref_rows(&self) -> &[Option<MemberRef>] {
        &self.member_refs
    }

    /// The type called `name`.
    ///
    /// A full name (`Terraria.Main`, `Terraria.Main/Nested`) is preferred, then the simple
    /// name of a top-level type, then the simple name of a nested one.
    #[must_use]
    pub fn find_type(&self, name: &str) -> Option<&TypeDef> {
        self.type_index(name).map(|index| &self.types[index])
    }

    fn type_index(&self, name: &str) -> Option<usize> {
        let types = &self.types;
        types
            .iter()
            .position(|definition| definition.full_name() == name)
            .or_else(|| {
                types
                    .iter()
                    .position(|definition| !definition.is_nested() && definition.name == name)
            })
            .or_else(|| types.iter().position(|definition| definition.name == name))
    }

    /// Like [`BinaryModel::find_type`], failing with [`Error::DefinitionNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] if no such type exists.
    pub fn type_def(&self, name: &str) -> Result<&TypeDef> {
        self.find_type(name).ok_or_else(|| not_found(DefinitionKind::Type, name))
    }

    /// Mutable access to a type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] if no such type exists.
    pub fn type_def_mut(&mut self, name: &str) -> Result<&mut TypeDef> {
        match self.type_index(name) {
            Some(index) => Ok(&mut self.types[index]),
            None => Err(not_found(DefinitionKind::Type, name)),
        }
    }

    /// The first method of `type_name` called `name` with `parameter_count` parameters,
    /// optionally restricted to static (`Some(true)`) or instance (`Some(false)`) methods.
    #[must_use]
    pub fn find_method(
        &self,
        type_name: &str,
        name: &str,
        parameter_count: usize,
        is_static: Option<bool>,
    ) -> Option<&MethodDef> {
        self.find_type(type_name)?.methods.iter().find(|method| {
            method.name == name
                && method.parameter_count() == parameter_count
                && is_static.map_or(true, |is_static| method.is_static() == is_static)
        })
    }

    /// The method of `type_name` called `name` with `parameter_count` parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] for the type or the method.
    pub fn method(&self, type_name: &str, name: &str, parameter_count: usize) -> Result<&MethodDef> {
        self.type_def(type_name)?
            .methods
            .iter()
            .find(|method| method.name == name && method.parameter_count() == parameter_count)
            .ok_or_else(|| method_not_found(type_name, name, parameter_count))
    }

    /// Mutable access to a method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] for the type or the method.
    pub fn method_mut(
        &mut self,
        type_name: &str,
        name: &str,
        parameter_count: usize,
    ) -> Result<&mut MethodDef> {
        self.type_def_mut(type_name)?
            .methods
            .iter_mut()
            .find(|method| method.name == name && method.parameter_count() == parameter_count)
            .ok_or_else(|| method_not_found(type_name, name, parameter_count))
    }

    /// A reference to a method of this module, usable as a `call` operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] for the type or the method.
    pub fn method_ref(&self, type_name: &str, name: &str, parameter_count: usize) -> Result<MethodRef> {
        let declaring_type = self.type_def(type_name)?.reference();
        let method = self.method(type_name, name, parameter_count)?;
        Ok(method.reference(declaring_type))
    }

    /// The field of `type_name` called `name`, if both exist.
    #[must_use]
    pub fn find_field(&self, type_name: &str, name: &str) -> Option<&FieldDef> {
        self.find_type(type_name)?.field(name)
    }

    /// The field of `type_name` called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] for the type or the field.
    pub fn field(&self, type_name: &str, name: &str) -> Result<&FieldDef> {
        self.type_def(type_name)?
            .field(name)
            .ok_or_else(|| not_found(DefinitionKind::Field, &format!("{type_name}::{name}")))
    }

    /// Returns `true` if `type_name` exists and declares a field called `name`.
    #[must_use]
    pub fn has_field(&self, type_name: &str, name: &str) -> bool {
        self.find_field(type_name, name).is_some()
    }

    /// Adds a public static field to `type_name` unless a field of that name exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] if the type does not exist.
    pub fn add_static_field(
        &mut self,
        type_name: &str,
        name: &str,
        field_type: TypeSig,
    ) -> Result<FieldRef> {
        let definition = self.type_def_mut(type_name)?;
        let declaring_type = definition.reference();

        if let Some(existing) = definition.field(name) {
            return Ok(existing.reference(declaring_type));
        }

        let field = FieldDef::new(FieldAttributes::PUBLIC | FieldAttributes::STATIC, name, field_type);
        let reference = field.reference(declaring_type);
        definition.fields.push(field);
        log::debug!("Added static field {reference}");
        Ok(reference)
    }

    /// Adds an assembly reference unless one with the same name exists.
    ///
    /// Returns the 0-based row of the reference.
    pub fn import_assembly(&mut self, assembly: &AssemblyRef) -> usize {
        if let Some(index) = self
            .assembly_refs
            .iter()
            .position(|existing| existing.name == assembly.name)
        {
            if self.assembly_refs[index].version != assembly.version {
                log::warn!(
                    "Keeping existing reference to {} {} instead of {}",
                    assembly.name,
                    self.assembly_refs[index].version,
                    assembly.version
                );
            }
            return index;
        }

        self.assembly_refs.push(assembly.clone());
        self.assembly_refs.len() - 1
    }

    /// Makes `reference` usable from this module.
    ///
    /// Module types must already be defined. External types get a type reference row, as do
    /// the types they are nested in; their assembly must have been imported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] for unknown module types and
    /// [`Error::UnresolvedReference`] if the scope assembly is not referenced.
    pub fn import_type(&mut self, reference: &TypeRef) -> Result<TypeRef> {
        if reference.is_local() {
            let known = self
                .types
                .iter()
                .any(|definition| definition.reference() == *reference);
            if !known {
                return Err(not_found(DefinitionKind::Type, &reference.full_name()));
            }
            return Ok(reference.clone());
        }

        if let ResolutionScope::Nested(outer) = &reference.scope {
            self.import_type(outer)?;
        }
        if let ResolutionScope::Assembly(assembly) = reference.root_scope() {
            if !self.assembly_refs.iter().any(|existing| &existing.name == assembly) {
                return Err(Error::UnresolvedReference(format!("[{assembly}]")));
            }
        }
        if !self.type_refs.contains(reference) {
            self.type_refs.push(reference.clone());
        }
        Ok(reference.clone())
    }

    /// Imports a method of another assembly so instructions can call it.
    ///
    /// Adds the assembly reference, the declaring type, every class type the signature names,
    /// and the member reference, reusing rows that already exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] if the signature names a module type that does not
    /// exist, and [`Error::UnresolvedReference`] if it names a type of an assembly that is not
    /// referenced.
    pub fn import_method(&mut self, method: &ExternalMethod) -> Result<MethodRef> {
        self.import_assembly(&method.assembly);
        let reference = method.reference();
        self.import_type(&reference.declaring_type)?;
        self.import_signature_types(
            std::iter::once(&reference.signature.return_type).chain(&reference.signature.params),
        )?;

        let member = MemberRef::Method(reference.clone());
        if !self.has_member_ref(&member) {
            log::debug!("Imported {method}");
            self.member_refs.push(Some(member));
        }
        Ok(reference)
    }

    /// Imports a field of another assembly.
    ///
    /// # Errors
    ///
    /// See [`BinaryModel::import_method`].
    pub fn import_field(&mut self, field: &FieldRef) -> Result<FieldRef> {
        self.import_type(&field.declaring_type)?;
        self.import_signature_types(std::iter::once(&field.field_type))?;

        if field.declaring_type.is_local() {
            return Ok(field.clone());
        }
        let member = MemberRef::Field(field.clone());
        if !self.has_member_ref(&member) {
            self.member_refs.push(Some(member));
        }
        Ok(field.clone())
    }

    fn has_member_ref(&self, member: &MemberRef) -> bool {
        let ambiguous = self.image.as_ref().map(|image| &image.ambiguous_member_refs);
        (1u32..).zip(&self.member_refs).any(|(row, existing)| {
            existing.as_ref() == Some(member) && !ambiguous.is_some_and(|rows| rows.contains(&row))
        })
    }

    fn import_signature_types<'a>(&mut self, types: impl Iterator<Item = &'a TypeSig>) -> Result<()> {
        for signature in types {
            for reference in signature.type_refs() {
                self.import_type(reference)?;
            }
        }
        Ok(())
    }
}

fn not_found(kind: DefinitionKind, name: &str) -> Error {
    Error::DefinitionNotFound {
        kind,
        name: name.to_string(),
    }
}

fn method_not_found(type_name: &str, name: &str, parameter_count: usize) -> Error {
    not_found(
        DefinitionKind::Method,
        &format!("{type_name}::{name}/{parameter_count}"),
    )
}
