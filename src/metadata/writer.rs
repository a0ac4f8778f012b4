//! Writes a [`BinaryModel`] back into an image.
//!
//! A loaded image is never re-laid-out. Its sections stay where they are; the rebuilt
//! metadata and every method body that was touched go into one section appended after the
//! last one, and the CLR header is pointed at the new metadata. Inside the metadata, loaded
//! rows and heap entries keep their values: heaps only grow, reference tables only get rows
//! appended, and definition rows keep every column the model does not describe.
//!
//! Adding a field or method to a type other than the last one shifts the `Field` or
//! `MethodDef` rows of every later type. Columns and coded indices referring to those rows are
//! renumbered, sorted tables are re-sorted, and tokens inside bodies that are kept byte for
//! byte are patched in place.
//!
//! A model that was not loaded from an image is wrapped into a fresh single-section image by
//! [`ImageBuilder`].

use std::collections::{HashMap, HashSet};

use crate::{
    assembly::{token_offsets, Operand, TokenProvider},
    file::{
        builder::{ImageBuilder, TEXT_RVA},
        io::{pad_to, read_le, write_le_at},
        IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_READ,
    },
    metadata::{
        cor20header::Cor20Header,
        loader::{Heaps, ModuleImage},
        method::{BodyEmitter, MethodBodyFlags},
        model::BinaryModel,
        references::{FieldRef, MemberRef, MethodRef, ResolutionScope, TypeRef},
        root::{Root, DEFAULT_VERSION},
        signatures::{
            field_sig_to_blob, instantiation_to_blob, local_sig_to_blob, type_spec_to_blob, TypeSig,
        },
        streams::{StreamHeader, TablesStream},
        tables::{
            sort_key, CodedIndexType, Column, TableId, HEAP_LARGE_BLOB, HEAP_LARGE_GUID,
            HEAP_LARGE_STRINGS, SORTED_TABLES,
        },
        token::{table, Token},
    },
    DefinitionKind, Error, Result,
};

/// Name of the section holding rewritten bodies and metadata.
pub(crate) const PATCH_SECTION: &str = ".patch";

/// `HashAlgId` of the `Assembly` row of fresh images (SHA-1).
const ASSEMBLY_HASH_SHA1: u32 = 0x8004;

/// Largest heap a 2-byte column can index.
const SMALL_HEAP: usize = 0xFFFF;

/// Maps loaded definition rows to their rows in the written image.
#[derive(Debug, Default)]
struct RowMaps {
    fields: Vec<u32>,
    methods: Vec<u32>,
    params: Vec<u32>,
    renumbered: bool,
}

impl RowMaps {
    fn row(&self, table: TableId, row: u32) -> u32 {
        let map = match table {
            TableId::Field => &self.fields,
            TableId::MethodDef => &self.methods,
            TableId::Param => &self.params,
            _ => return row,
        };
        (row as usize)
            .checked_sub(1)
            .and_then(|index| map.get(index))
            .copied()
            .unwrap_or(row)
    }

    fn token(&self, token: Token) -> Token {
        match TableId::from_id(token.table()) {
            Some(target @ (TableId::Field | TableId::MethodDef | TableId::Param)) => {
                Token::from_parts(token.table(), self.row(target, token.row()))
            }
            _ => token,
        }
    }

    fn remap_cell(&self, column: Column, cell: &mut u32) {
        match column {
            Column::Index(target) => *cell = self.row(target, *cell),
            Column::Coded(coded) => {
                if let Some((target, row)) = coded.decode(*cell) {
                    if let Some(value) = coded.encode(target, self.row(target, row)) {
                        *cell = value;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Numbers the rows of one definition table in model order.
///
/// Loaded rows must still be present, in their loaded order.
fn numbering(
    origins: impl Iterator<Item = Option<u32>>,
    loaded: u32,
    what: &str,
) -> Result<(Vec<u32>, bool)> {
    let mut map = Vec::with_capacity(loaded as usize);
    let mut moved = false;
    for (row, origin) in (1u32..).zip(origins) {
        let Some(origin) = origin else {
            continue;
        };
        #[allow(clippy::cast_possible_truncation)]
        let expected = map.len() as u32 + 1;
        if origin != expected {
            return Err(Error::Unsupported(format!(
                "{what} rows were removed or reordered"
            )));
        }
        map.push(row);
        moved |= origin != row;
    }
    if map.len() != loaded as usize {
        return Err(Error::Unsupported(format!("{what} rows were removed")));
    }
    Ok((map, moved))
}

/// Offset and length of the code of the body starting at `data`.
fn code_range(data: &[u8]) -> Result<(usize, usize)> {
    let Some(first) = data.first() else {
        return Err(out_of_bounds_error!());
    };
    match MethodBodyFlags::from_bits_truncate(u16::from(first & 0b11)) {
        MethodBodyFlags::TINY_FORMAT => Ok((1, usize::from(first >> 2))),
        MethodBodyFlags::FAT_FORMAT => {
            let flags = read_le::<u16>(data)?;
            let code_size = read_le::<u32>(data.get(4..).unwrap_or_default())?;
            Ok((usize::from(flags >> 12) * 4, code_size as usize))
        }
        _ => Err(malformed_error!("Unknown method header 0x{:02X}", first)),
    }
}

/// A deterministic module version id derived from the assembly name.
fn mvid(name: &str) -> uguid::Guid {
    let mut bytes = [0u8; 16];
    for (half, seed) in [0xCBF2_9CE4_8422_2325_u64, 0x8422_2325_CBF2_9CE4].iter().enumerate() {
        let mut hash = *seed;
        for byte in name.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01B3);
        }
        bytes[half * 8..half * 8 + 8].copy_from_slice(&hash.to_le_bytes());
    }
    uguid::Guid::from_bytes(bytes)
}

fn fresh_metadata(model: &BinaryModel) -> (TablesStream, Heaps) {
    let mut tables = TablesStream::new();
    let mut heaps = Heaps::default();

    let module_name = heaps.strings.add(&format!("{}.dll", model.name));
    let mvid = heaps.guids.add(mvid(&model.name));
    tables
        .table_mut(TableId::Module)
        .push(&[0, module_name, mvid, 0, 0]);

    let version = model.version;
    let name = heaps.strings.add(&model.name);
    tables.table_mut(TableId::Assembly).push(&[
        ASSEMBLY_HASH_SHA1,
        version.major.into(),
        version.minor.into(),
        version.build.into(),
        version.revision.into(),
        0,
        0,
        name,
        0,
    ]);
    (tables, heaps)
}

fn fresh_root() -> Root {
    let mut root = Root::new(DEFAULT_VERSION);
    root.stream_headers = ["#~", "#Strings", "#US", "#GUID", "#Blob"]
        .into_iter()
        .map(|name| StreamHeader {
            offset: 0,
            size: 0,
            name: name.to_string(),
        })
        .collect();
    root
}

fn coded(coded: CodedIndexType, token: Token) -> Result<u32> {
    TableId::from_id(token.table())
        .and_then(|target| coded.encode(target, token.row()))
        .ok_or_else(|| malformed_error!("Token {} cannot be stored as a {:?}", token, coded))
}

struct Writer<'m> {
    model: &'m BinaryModel,
    module: Option<&'m ModuleImage>,
    tables: TablesStream,
    heaps: Heaps,
    maps: RowMaps,
    def_refs: Vec<TypeRef>,
    def_rows: HashMap<TypeRef, u32>,
    ref_rows: HashMap<&'m TypeRef, u32>,
    field_defs: Vec<FieldRef>,
    field_def_rows: HashMap<FieldRef, u32>,
    method_defs: Vec<MethodRef>,
    method_def_rows: HashMap<MethodRef, u32>,
    field_ref_rows: HashMap<&'m FieldRef, u32>,
    method_ref_rows: HashMap<&'m MethodRef, u32>,
    code: Vec<u8>,
    code_rva: u32,
    method_rvas: Vec<u32>,
    patches: Vec<(usize, u32)>,
}

impl<'m> Writer<'m> {
    fn new(model: &'m BinaryModel) -> Result<Self> {
        let module = model.image.as_deref();
        let (tables, heaps) = match module {
            Some(module) => (module.tables.clone(), module.heaps.clone()),
            None => fresh_metadata(model),
        };
        let loaded = |table: TableId| module.map_or(0, |module| module.tables.rows(table));

        let loaded_types = loaded(TableId::TypeDef) as usize;
        let rows_kept = model.types.len() >= loaded_types
            && model.types.iter().enumerate().all(|(index, definition)| {
                #[allow(clippy::cast_possible_truncation)]
                let row = index as u32 + 1;
                definition.row == (index < loaded_types).then_some(row)
            });
        if !rows_kept {
            return Err(Error::Unsupported(
                "loaded type definitions were removed or reordered".to_string(),
            ));
        }

        let fields = model.types.iter().flat_map(|definition| &definition.fields);
        let methods = model.types.iter().flat_map(|definition| &definition.methods);
        let (field_map, fields_moved) = numbering(
            fields.map(|field| field.origin.as_ref().map(|origin| origin.row)),
            loaded(TableId::Field),
            "Field",
        )?;
        let (method_map, methods_moved) = numbering(
            methods.clone().map(|method| method.origin.as_ref().map(|origin| origin.row)),
            loaded(TableId::MethodDef),
            "MethodDef",
        )?;
        let (param_map, params_moved) = numbering(
            methods
                .flat_map(|method| &method.parameters)
                .map(|parameter| parameter.row),
            loaded(TableId::Param),
            "Param",
        )?;
        let maps = RowMaps {
            fields: field_map,
            methods: method_map,
            params: param_map,
            renumbered: fields_moved || methods_moved || params_moved,
        };

        let mut writer = Writer {
            model,
            module,
            tables,
            heaps,
            maps,
            def_refs: Vec::with_capacity(model.types.len()),
            def_rows: HashMap::new(),
            ref_rows: HashMap::new(),
            field_defs: Vec::new(),
            field_def_rows: HashMap::new(),
            method_defs: Vec::new(),
            method_def_rows: HashMap::new(),
            field_ref_rows: HashMap::new(),
            method_ref_rows: HashMap::new(),
            code: Vec::new(),
            code_rva: module.map_or(TEXT_RVA, |module| module.image.layout.next_section_rva()),
            method_rvas: Vec::new(),
            patches: Vec::new(),
        };
        writer.index_definitions();
        Ok(writer)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index_definitions(&mut self) {
        let model = self.model;
        for definition in &model.types {
            let reference = definition.reference();
            for field in &definition.fields {
                let field = field.reference(reference.clone());
                self.field_def_rows
                    .entry(field.clone())
                    .or_insert(self.field_defs.len() as u32 + 1);
                self.field_defs.push(field);
            }
            for method in &definition.methods {
                let method = method.reference(reference.clone());
                self.method_def_rows
                    .entry(method.clone())
                    .or_insert(self.method_defs.len() as u32 + 1);
                self.method_defs.push(method);
            }
            self.def_rows
                .entry(reference.clone())
                .or_insert(self.def_refs.len() as u32 + 1);
            self.def_refs.push(reference);
        }

        for (row, reference) in (1u32..).zip(model.type_refs()) {
            self.ref_rows.entry(reference).or_insert(row);
        }

        let ambiguous = self.module.map(|module| &module.ambiguous_member_refs);
        for (row, member) in (1u32..).zip(model.member_ref_rows()) {
            if ambiguous.is_some_and(|rows| rows.contains(&row)) {
                continue;
            }
            match member {
                Some(MemberRef::Field(field)) => {
                    self.field_ref_rows.entry(field).or_insert(row);
                }
                Some(MemberRef::Method(method)) => {
                    self.method_ref_rows.entry(method).or_insert(row);
                }
                None => {}
            }
        }
    }

    fn loaded_rows(&self, table: TableId) -> u32 {
        self.module.map_or(0, |module| module.tables.rows(table))
    }

    fn type_token(&self, reference: &TypeRef) -> Result<Token> {
        if let Some(token) = reference.token() {
            let index = token.row() as usize;
            let current = match token.table() {
                table::TYPE_DEF => index
                    .checked_sub(1)
                    .and_then(|index| self.def_refs.get(index))
                    .is_some_and(|existing| existing == reference),
                table::TYPE_REF => index
                    .checked_sub(1)
                    .and_then(|index| self.model.type_refs().get(index))
                    .is_some_and(|existing| existing == reference),
                table::TYPE_SPEC => {
                    index != 0 && self.module.is_some_and(|module| index <= module.type_specs.len())
                }
                _ => false,
            };
            if current {
                return Ok(token);
            }
        }

        if let Some(row) = self.def_rows.get(reference) {
            return Ok(Token::from_parts(table::TYPE_DEF, *row));
        }
        if let Some(row) = self.ref_rows.get(reference) {
            return Ok(Token::from_parts(table::TYPE_REF, *row));
        }

        if reference.is_local() {
            Err(Error::DefinitionNotFound {
                kind: DefinitionKind::Type,
                name: reference.full_name(),
            })
        } else {
            Err(Error::UnresolvedReference(reference.to_string()))
        }
    }

    fn field_token(&self, field: &FieldRef) -> Result<Token> {
        if let Some(token) = field.token() {
            match token.table() {
                table::FIELD => {
                    let row = self.maps.row(TableId::Field, token.row());
                    let current = (row as usize)
                        .checked_sub(1)
                        .and_then(|index| self.field_defs.get(index))
                        .is_some_and(|existing| existing == field);
                    if current {
                        return Ok(Token::from_parts(table::FIELD, row));
                    }
                }
                table::MEMBER_REF => {
                    if let Some(Some(MemberRef::Field(existing))) = self.member_row(token) {
                        if existing == field {
                            return Ok(token);
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(row) = self.field_def_rows.get(field) {
            return Ok(Token::from_parts(table::FIELD, *row));
        }
        if let Some(row) = self.field_ref_rows.get(field) {
            return Ok(Token::from_parts(table::MEMBER_REF, *row));
        }

        if field.declaring_type.is_local() {
            Err(Error::DefinitionNotFound {
                kind: DefinitionKind::Field,
                name: field.full_name(),
            })
        } else {
            Err(Error::UnresolvedReference(field.full_name()))
        }
    }

    fn member_row(&self, token: Token) -> Option<&'m Option<MemberRef>> {
        let model = self.model;
        token
            .index()
            .and_then(|index| model.member_ref_rows().get(index))
    }

    fn method_token(&mut self, method: &MethodRef) -> Result<Token> {
        if !method.instantiation.is_empty() {
            return self.method_spec_token(method);
        }

        if let Some(token) = method.token() {
            match token.table() {
                table::METHOD_DEF => {
                    let row = self.maps.row(TableId::MethodDef, token.row());
                    let current = (row as usize)
                        .checked_sub(1)
                        .and_then(|index| self.method_defs.get(index))
                        .is_some_and(|existing| existing == method);
                    if current {
                        return Ok(Token::from_parts(table::METHOD_DEF, row));
                    }
                }
                table::MEMBER_REF => {
                    if let Some(Some(MemberRef::Method(existing))) = self.member_row(token) {
                        if existing == method {
                            return Ok(token);
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(row) = self.method_def_rows.get(method) {
            return Ok(Token::from_parts(table::METHOD_DEF, *row));
        }
        if let Some(row) = self.method_ref_rows.get(method) {
            return Ok(Token::from_parts(table::MEMBER_REF, *row));
        }

        if method.declaring_type.is_local() {
            Err(Error::DefinitionNotFound {
                kind: DefinitionKind::Method,
                name: method.full_name(),
            })
        } else {
            Err(Error::UnresolvedReference(method.full_name()))
        }
    }

    fn method_spec_token(&mut self, method: &MethodRef) -> Result<Token> {
        if let (Some(token), Some(module)) = (method.token(), self.module) {
            let current = token.table() == table::METHOD_SPEC
                && token
                    .index()
                    .and_then(|index| module.method_specs.get(index))
                    .is_some_and(|existing| existing.as_ref() == Some(method));
            if current {
                return Ok(token);
            }
        }

        let generic = self.method_token(&method.generic_method())?;
        let parent = coded(CodedIndexType::MethodDefOrRef, generic)?;
        let blob = instantiation_to_blob(&method.instantiation, &mut |reference: &TypeRef| {
            self.type_token(reference)
        })?;
        let blob = self.heaps.blobs.add(&blob);
        Ok(self.find_or_push(TableId::MethodSpec, &[parent, blob]))
    }

    /// The row of `table` holding exactly `cells`, appending one if there is none.
    fn find_or_push(&mut self, table: TableId, cells: &[u32]) -> Token {
        let raw = self.tables.table_mut(table);
        let found = raw.iter().position(|row| row == cells);
        let row = match found {
            #[allow(clippy::cast_possible_truncation)]
            Some(index) => index as u32 + 1,
            None => raw.push(cells),
        };
        Token::from_parts(table as u8, row)
    }

    fn resolution_scope(&mut self, reference: &TypeRef) -> Result<u32> {
        let (target, row) = match &reference.scope {
            ResolutionScope::Module => (TableId::Module, 1),
            ResolutionScope::Assembly(name) => {
                let Some(index) = self
                    .model
                    .assembly_refs()
                    .iter()
                    .position(|assembly| &assembly.name == name)
                else {
                    return Err(Error::UnresolvedReference(format!("[{name}]")));
                };
                #[allow(clippy::cast_possible_truncation)]
                let row = index as u32 + 1;
                (TableId::AssemblyRef, row)
            }
            ResolutionScope::ModuleRef(name) => (TableId::ModuleRef, self.module_ref_row(name)),
            ResolutionScope::Nested(outer) => {
                let token = self.type_token(outer)?;
                if token.table() != table::TYPE_REF {
                    return Err(Error::Unsupported(format!(
                        "reference to {reference} nested in a type definition"
                    )));
                }
                (TableId::TypeRef, token.row())
            }
        };
        coded(CodedIndexType::ResolutionScope, Token::from_parts(target as u8, row))
    }

    fn module_ref_row(&mut self, name: &str) -> u32 {
        let strings = &self.heaps.strings;
        let existing = self
            .tables
            .table(TableId::ModuleRef)
            .iter()
            .position(|cells| strings.get(cells[0]).is_ok_and(|value| value == name));
        match existing {
            #[allow(clippy::cast_possible_truncation)]
            Some(index) => index as u32 + 1,
            None => {
                let name = self.heaps.strings.add(name);
                self.tables.table_mut(TableId::ModuleRef).push(&[name])
            }
        }
    }

    fn string_cell(&mut self, current: u32, value: &str) -> u32 {
        if self.heaps.strings.get(current).is_ok_and(|existing| existing == value) {
            current
        } else {
            self.heaps.strings.add(value)
        }
    }

    /// Appends the assembly and type references the model imported.
    fn append_references(&mut self) -> Result<()> {
        let model = self.model;

        let loaded = self.loaded_rows(TableId::AssemblyRef) as usize;
        for assembly in model.assembly_refs().iter().skip(loaded) {
            let version = assembly.version;
            let name = self.heaps.strings.add(&assembly.name);
            self.tables.table_mut(TableId::AssemblyRef).push(&[
                version.major.into(),
                version.minor.into(),
                version.build.into(),
                version.revision.into(),
                0,
                0,
                name,
                0,
                0,
            ]);
        }

        let loaded = self.loaded_rows(TableId::TypeRef) as usize;
        for reference in model.type_refs().iter().skip(loaded) {
            let scope = self.resolution_scope(reference)?;
            let name = self.heaps.strings.add(&reference.name);
            let namespace = self.heaps.strings.add(&reference.namespace);
            self.tables
                .table_mut(TableId::TypeRef)
                .push(&[scope, name, namespace]);
        }
        Ok(())
    }

    /// Appends the member references the model imported.
    fn append_member_refs(&mut self) -> Result<()> {
        let model = self.model;
        let loaded = self.loaded_rows(TableId::MemberRef) as usize;
        for member in model.member_ref_rows().iter().skip(loaded).flatten() {
            let class = self.type_token(member.declaring_type())?;
            let parent = coded(CodedIndexType::MemberRefParent, class)?;
            let types = &mut |reference: &TypeRef| self.type_token(reference);
            let (name, blob) = match member {
                MemberRef::Field(field) => (&field.name, field_sig_to_blob(&field.field_type, types)?),
                MemberRef::Method(method) => (&method.name, method.signature.to_blob(types)?),
            };
            let name = self.heaps.strings.add(name);
            let blob = self.heaps.blobs.add(&blob);
            self.tables
                .table_mut(TableId::MemberRef)
                .push(&[parent, name, blob]);
        }
        Ok(())
    }

    /// Renumbers every reference to a shifted `Field`, `MethodDef` or `Param` row.
    fn renumber_rows(&mut self) -> Result<()> {
        if let Some(module) = self.module {
            let edit_and_continue = !module.tables.table(TableId::EncLog).is_empty()
                || !module.tables.table(TableId::EncMap).is_empty();
            if module.cor20.vtable_fixups_size != 0 || edit_and_continue {
                return Err(Error::Unsupported(
                    "shifting definition rows of an image with VTable fixups or edit-and-continue tables"
                        .to_string(),
                ));
            }
        }

        let maps = &self.maps;
        for (table, raw) in self.tables.tables_mut() {
            if matches!(
                table,
                TableId::TypeDef | TableId::Field | TableId::MethodDef | TableId::Param
            ) {
                continue;
            }
            for (column, cell) in raw.cells_mut() {
                maps.remap_cell(column, cell);
            }
        }
        log::debug!("Renumbered rows referring to shifted definitions");
        Ok(())
    }

    /// Encodes touched and new bodies; patches tokens of kept bodies if rows shifted.
    fn emit_bodies(&mut self) -> Result<()> {
        let model = self.model;
        let mut patched = HashSet::new();

        for definition in &model.types {
            for method in &definition.methods {
                let rva = match (&method.origin, method.is_dirty()) {
                    (Some(origin), false) => {
                        let has_il = method.impl_flags.bits() & 0x0003 == 0;
                        if self.maps.renumbered && origin.rva != 0 && has_il {
                            self.patch_body(origin.rva, &mut patched)?;
                        }
                        origin.rva
                    }
                    _ => match method.body() {
                        Some(body) => {
                            let encoded = body.encode(self).inspect_err(|error| {
                                log::warn!(
                                    "Failed to encode {}::{}: {error}",
                                    definition.full_name(),
                                    method.name
                                );
                            })?;
                            pad_to(&mut self.code, 4);
                            #[allow(clippy::cast_possible_truncation)]
                            let rva = self.code_rva + self.code.len() as u32;
                            self.code.extend_from_slice(&encoded);
                            rva
                        }
                        None => 0,
                    },
                };
                self.method_rvas.push(rva);
            }
        }
        Ok(())
    }

    fn patch_body(&mut self, rva: u32, patched: &mut HashSet<usize>) -> Result<()> {
        let Some(module) = self.module else {
            return Ok(());
        };
        let image = &module.image;
        let data = image.tail_at_rva(rva)?;
        let (header, size) = code_range(data)?;
        let Some(code) = header.checked_add(size).and_then(|end| data.get(header..end)) else {
            return Err(out_of_bounds_error!());
        };
        let start = image.layout.rva_to_offset(rva)? + header;

        let tokens = token_offsets(code).map_err(|error| {
            Error::Unsupported(format!(
                "cannot renumber the tokens of the body at RVA 0x{rva:X}: {error}"
            ))
        })?;
        for (offset, token) in tokens {
            let renumbered = self.maps.token(token);
            if renumbered != token && patched.insert(start + offset) {
                self.patches.push((start + offset, renumbered.value()));
            }
        }
        Ok(())
    }

    /// Rebuilds the `TypeDef`, `Field`, `MethodDef` and `Param` tables in model order.
    fn build_definitions(&mut self) -> Result<()> {
        let model = self.model;
        let module = self.module;
        let loaded_row = |table: TableId, row: Option<u32>, width: usize| -> Vec<u32> {
            row.and_then(|row| module.and_then(|module| module.tables.table(table).row(row)))
                .map_or_else(|| vec![0; width], <[u32]>::to_vec)
        };

        let mut type_rows = Vec::with_capacity(model.types.len());
        let mut field_rows = Vec::new();
        let mut method_rows = Vec::new();
        let mut param_rows = Vec::new();
        let mut nested = Vec::new();
        let mut methods = 0;

        for (definition, row) in model.types.iter().zip(1u32..) {
            let mut cells = loaded_row(TableId::TypeDef, definition.row, 6);
            cells[0] = definition.flags.bits();
            cells[1] = self.string_cell(cells[1], &definition.name);
            cells[2] = self.string_cell(cells[2], &definition.namespace);
            #[allow(clippy::cast_possible_truncation)]
            {
                cells[4] = field_rows.len() as u32 + 1;
                cells[5] = method_rows.len() as u32 + 1;
            }
            type_rows.push(cells);

            if let (None, Some(outer)) = (definition.row, &definition.declaring_type) {
                let token = self.type_token(outer)?;
                if token.table() != table::TYPE_DEF {
                    return Err(Error::DefinitionNotFound {
                        kind: DefinitionKind::Type,
                        name: outer.full_name(),
                    });
                }
                nested.push([row, token.row()]);
            }

            for field in &definition.fields {
                let origin = field.origin.as_ref();
                let mut cells = loaded_row(TableId::Field, origin.map(|origin| origin.row), 3);
                cells[0] = field.flags.bits().into();
                cells[1] = self.string_cell(cells[1], &field.name);
                if origin.map_or(true, |origin| origin.field_type != field.field_type) {
                    let blob = field_sig_to_blob(&field.field_type, &mut |reference: &TypeRef| {
                        self.type_token(reference)
                    })?;
                    cells[2] = self.heaps.blobs.add(&blob);
                }
                field_rows.push(cells);
            }

            for method in &definition.methods {
                let origin = method.origin.as_ref();
                let mut cells = loaded_row(TableId::MethodDef, origin.map(|origin| origin.row), 6);
                cells[0] = self.method_rvas.get(methods).copied().unwrap_or_default();
                methods += 1;
                cells[1] = method.impl_flags.bits().into();
                cells[2] = method.flags.bits().into();
                cells[3] = self.string_cell(cells[3], &method.name);
                if origin.map_or(true, |origin| origin.signature != method.signature) {
                    let blob = method
                        .signature
                        .to_blob(&mut |reference: &TypeRef| self.type_token(reference))?;
                    cells[4] = self.heaps.blobs.add(&blob);
                }
                #[allow(clippy::cast_possible_truncation)]
                {
                    cells[5] = param_rows.len() as u32 + 1;
                }
                method_rows.push(cells);

                for parameter in &method.parameters {
                    let mut cells = loaded_row(TableId::Param, parameter.row, 3);
                    cells[0] = parameter.flags.bits().into();
                    cells[1] = parameter.sequence.into();
                    cells[2] = self.string_cell(cells[2], &parameter.name);
                    param_rows.push(cells);
                }
            }
        }

        self.tables.table_mut(TableId::TypeDef).set_rows(type_rows);
        self.tables.table_mut(TableId::Field).set_rows(field_rows);
        self.tables.table_mut(TableId::MethodDef).set_rows(method_rows);
        self.tables.table_mut(TableId::Param).set_rows(param_rows);
        for cells in nested {
            self.tables.table_mut(TableId::NestedClass).push(&cells);
        }
        Ok(())
    }

    /// Restores the order of sorted tables that grew or had rows renumbered.
    fn sort_tables(&mut self) {
        for target in SORTED_TABLES {
            let grew = self.tables.rows(target) != self.loaded_rows(target);
            if !(grew || self.maps.renumbered) {
                continue;
            }

            let key = sort_key(target);
            let raw = self.tables.table(target);
            let rows: Vec<&[u32]> = raw.iter().collect();
            let mut order: Vec<usize> = (0..rows.len()).collect();
            order.sort_by(|a, b| {
                key.iter()
                    .map(|column| rows[*a][*column].cmp(&rows[*b][*column]))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if order.iter().enumerate().all(|(position, index)| position == *index) {
                continue;
            }

            let sorted: Vec<Vec<u32>> = order.iter().map(|index| rows[*index].to_vec()).collect();
            let mut moved_to = vec![0u32; order.len()];
            for (position, index) in order.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                {
                    moved_to[*index] = position as u32 + 1;
                }
            }
            self.tables.table_mut(target).set_rows(sorted);
            self.redirect(target, &moved_to);
            log::debug!("Re-sorted the {target:?} table");
        }
    }

    /// Points references to rows of `target` at their new position.
    fn redirect(&mut self, target: TableId, moved_to: &[u32]) {
        let new_row = |row: u32| {
            (row as usize)
                .checked_sub(1)
                .and_then(|index| moved_to.get(index))
                .copied()
                .unwrap_or(row)
        };
        for (_, raw) in self.tables.tables_mut() {
            for (column, cell) in raw.cells_mut() {
                match column {
                    Column::Index(table) | Column::List(table) if table == target => {
                        *cell = new_row(*cell);
                    }
                    Column::Coded(coded) => {
                        if let Some((table, row)) = coded.decode(*cell) {
                            if table == target {
                                if let Some(value) = coded.encode(table, new_row(row)) {
                                    *cell = value;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn is_modified(&self, module: &ModuleImage) -> bool {
        !self.code.is_empty()
            || !self.patches.is_empty()
            || self.tables != module.tables
            || self.heaps.strings.is_modified()
            || self.heaps.user_strings.is_modified()
            || self.heaps.blobs.is_modified()
            || self.heaps.guids.is_modified()
    }

    /// The metadata directory: the root followed by its streams, in root order.
    fn metadata(&self, root: &Root, loaded: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut required = 0;
        if self.heaps.strings.data().len() > SMALL_HEAP {
            required |= HEAP_LARGE_STRINGS;
        }
        if self.heaps.guids.data().len() / 16 > SMALL_HEAP {
            required |= HEAP_LARGE_GUID;
        }
        if self.heaps.blobs.data().len() > SMALL_HEAP {
            required |= HEAP_LARGE_BLOB;
        }
        let tables = self.tables.write(required)?;

        let mut streams = Vec::with_capacity(root.stream_headers.len() + 1);
        let mut has_user_strings = false;
        for header in &root.stream_headers {
            let bytes = match header.name.as_str() {
                "#~" => tables.clone(),
                "#Strings" => self.heaps.strings.data().to_vec(),
                "#US" => {
                    has_user_strings = true;
                    self.heaps.user_strings.data().to_vec()
                }
                "#Blob" => self.heaps.blobs.data().to_vec(),
                "#GUID" => self.heaps.guids.data().to_vec(),
                _ => {
                    let start = header.offset as usize;
                    loaded
                        .and_then(|data| data.get(start..start + header.size as usize))
                        .ok_or_else(|| out_of_bounds_error!())?
                        .to_vec()
                }
            };
            streams.push((header.name.clone(), bytes));
        }
        if !has_user_strings && self.heaps.user_strings.is_modified() {
            streams.push(("#US".to_string(), self.heaps.user_strings.data().to_vec()));
        }

        Ok(root.write(&streams))
    }

    fn finish_loaded(mut self, module: &ModuleImage) -> Result<Vec<u8>> {
        if !self.is_modified(module) {
            log::debug!("Model unchanged, keeping the image as loaded");
            return Ok(module.image.data().to_vec());
        }

        let mut contents = std::mem::take(&mut self.code);
        pad_to(&mut contents, 4);
        #[allow(clippy::cast_possible_truncation)]
        let metadata_rva = self.code_rva + contents.len() as u32;
        let metadata = self.metadata(&module.root, Some(module.metadata.as_slice()))?;
        contents.extend_from_slice(&metadata);

        let mut image = module.image.append_section(
            PATCH_SECTION,
            &contents,
            IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        )?;

        let mut cor20 = module.cor20;
        cor20.meta_data_rva = metadata_rva;
        cor20.meta_data_size = u32::try_from(metadata.len())
            .map_err(|_| Error::Unsupported(format!("metadata of {} bytes", metadata.len())))?;
        cor20.entry_point_token = self.maps.token(Token::new(cor20.entry_point_token)).value();
        let header = cor20.write();
        let Some(target) = image.get_mut(module.cor20_offset..module.cor20_offset + header.len()) else {
            return Err(out_of_bounds_error!());
        };
        target.copy_from_slice(&header);

        for (offset, value) in &self.patches {
            write_le_at(&mut image, &mut { *offset }, *value)?;
        }

        if cor20.is_strong_name_signed() {
            log::warn!("The image is strong-name signed; the rewritten image no longer matches its signature");
        }
        log::debug!(
            "Rewrote metadata of {}: {} bytes of bodies, {} bytes of metadata, {} tokens patched",
            self.model.name,
            metadata_rva - self.code_rva,
            metadata.len(),
            self.patches.len()
        );
        Ok(image)
    }

    fn finish_fresh(mut self) -> Result<Vec<u8>> {
        let mut text = std::mem::take(&mut self.code);
        pad_to(&mut text, 4);
        #[allow(clippy::cast_possible_truncation)]
        let metadata_rva = TEXT_RVA + text.len() as u32;
        let metadata = self.metadata(&fresh_root(), None)?;
        text.extend_from_slice(&metadata);
        pad_to(&mut text, 4);

        #[allow(clippy::cast_possible_truncation)]
        let cor20_offset = text.len() as u32;
        #[allow(clippy::cast_possible_truncation)]
        let cor20 = Cor20Header::new(metadata_rva, metadata.len() as u32);
        text.extend_from_slice(&cor20.write());

        log::debug!(
            "Built image of {} {}: {} bytes of metadata",
            self.model.name,
            self.model.version,
            metadata.len()
        );
        Ok(ImageBuilder::new(text).clr_header(cor20_offset).build())
    }
}

impl TokenProvider for Writer<'_> {
    fn token(&mut self, operand: &Operand) -> Result<Token> {
        match operand {
            Operand::String(value) => {
                let index = self.heaps.user_strings.add(value)?;
                if index > 0x00FF_FFFF {
                    return Err(Error::Unsupported(
                        "user string heap exceeds 16 MiB".to_string(),
                    ));
                }
                Ok(Token::from_parts(table::USER_STRING, index))
            }
            Operand::Field(field) => self.field_token(field),
            Operand::Method(method) => self.method_token(method),
            Operand::Type(reference) => self.type_token(reference),
            Operand::TypeSig(signature) => {
                let blob = type_spec_to_blob(signature, &mut |reference: &TypeRef| {
                    self.type_token(reference)
                })?;
                let blob = self.heaps.blobs.add(&blob);
                Ok(self.find_or_push(TableId::TypeSpec, &[blob]))
            }
            Operand::CallSite(signature) => {
                let blob = signature.to_blob(&mut |reference: &TypeRef| self.type_token(reference))?;
                let blob = self.heaps.blobs.add(&blob);
                Ok(self.find_or_push(TableId::StandAloneSig, &[blob]))
            }
            other => Err(malformed_error!("Operand {:?} has no metadata token", other)),
        }
    }
}

impl BodyEmitter for Writer<'_> {
    fn local_signature_token(&mut self, locals: &[TypeSig]) -> Result<Token> {
        let blob = local_sig_to_blob(locals, &mut |reference: &TypeRef| self.type_token(reference))?;
        let blob = self.heaps.blobs.add(&blob);
        Ok(self.find_or_push(TableId::StandAloneSig, &[blob]))
    }
}

/// Serializes `model` into a complete image.
///
/// # Errors
///
/// Returns [`Error::DefinitionNotFound`] / [`Error::UnresolvedReference`] if a body or
/// signature refers to something the model does not define or import, and
/// [`Error::Unsupported`] if loaded definitions were removed or reordered, or the image
/// cannot take another section.
pub(crate) fn write(model: &BinaryModel) -> Result<Vec<u8>> {
    let mut writer = Writer::new(model)?;
    writer.append_references()?;
    if writer.maps.renumbered {
        writer.renumber_rows()?;
    }
    writer.append_member_refs()?;
    writer.emit_bodies()?;
    writer.build_definitions()?;
    writer.sort_tables();

    match model.image.as_deref() {
        Some(module) => writer.finish_loaded(module),
        None => writer.finish_fresh(),
    }
}
