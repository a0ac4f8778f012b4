//! Reads the metadata of a managed image into a [`BinaryModel`].
//!
//! The CLR header found through data directory 14 points at the metadata root, whose stream
//! directory locates the `#~` tables and the heaps. Rows are resolved bottom-up: assembly and
//! module references, type references, type definitions with their fields and methods, then
//! the member references, constructed types, instantiations and standalone signatures that
//! method bodies refer to. Bodies are decoded last, once every token they may contain
//! resolves.
//!
//! Signatures of definitions must decode. A member reference, type specification or
//! standalone signature that does not is kept as an unresolved row so row numbers stay
//! aligned; a body referring to it fails to decode and is kept byte for byte.

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
};

use crate::{
    assembly::{Operand, OperandType, TokenResolver},
    file::{File, LoadedImage},
    metadata::{
        cor20header::Cor20Header,
        method::{
            BodyResolver, MethodAttributes, MethodBody, MethodDef, MethodImplAttributes,
            MethodOrigin, ParamAttributes, Parameter,
        },
        model::{BinaryModel, StandAloneSig},
        references::{AssemblyRef, FieldRef, MemberRef, MethodRef, ResolutionScope, TypeRef, Version},
        root::Root,
        signatures::{
            field_sig_from_blob, instantiation_from_blob, is_field_sig, is_local_sig,
            local_sig_from_blob, type_spec_from_blob, MethodSig, TypeSig,
        },
        streams::{BlobHeap, GuidHeap, StringHeap, TablesStream, UserStringHeap},
        tables::{CodedIndexType, TableId},
        token::{table, Token},
        typedef::{FieldAttributes, FieldDef, FieldOrigin, TypeAttributes, TypeDef, MODULE_TYPE_NAME},
    },
    Error, Result,
};

/// Deepest chain of enclosing types or resolution scopes followed.
const MAX_NESTING: usize = 64;

/// `CodeTypeMask` of the method implementation flags; 0 is IL.
const CODE_TYPE_MASK: u16 = 0x0003;

/// The heaps of a metadata root.
#[derive(Debug, Clone, Default)]
pub(crate) struct Heaps {
    pub(crate) strings: StringHeap,
    pub(crate) user_strings: UserStringHeap,
    pub(crate) blobs: BlobHeap,
    pub(crate) guids: GuidHeap,
}

impl Heaps {
    fn read(root: &Root, metadata: &[u8]) -> Result<(TablesStream, Heaps)> {
        let mut tables = None;
        let mut heaps = Heaps::default();

        for header in &root.stream_headers {
            let start = header.offset as usize;
            let Some(data) = metadata.get(start..start + header.size as usize) else {
                return Err(out_of_bounds_error!());
            };

            match header.name.as_str() {
                "#~" => tables = Some(TablesStream::read(data)?),
                "#-" => {
                    return Err(Error::Unsupported(
                        "uncompressed '#-' table stream".to_string(),
                    ))
                }
                "#Strings" => heaps.strings = StringHeap::from(data)?,
                "#US" => heaps.user_strings = UserStringHeap::from(data)?,
                "#Blob" => heaps.blobs = BlobHeap::from(data)?,
                "#GUID" => heaps.guids = GuidHeap::from(data),
                other => log::debug!("Carrying over metadata stream '{other}'"),
            }
        }

        match tables {
            Some(tables) => Ok((tables, heaps)),
            None => Err(Error::BinaryFormat("metadata has no '#~' stream".to_string())),
        }
    }
}

/// What the writer needs of a loaded image besides the model itself.
#[derive(Debug, Clone)]
pub(crate) struct ModuleImage {
    pub(crate) image: LoadedImage,
    pub(crate) cor20: Cor20Header,
    pub(crate) cor20_offset: usize,
    pub(crate) root: Root,
    /// The metadata directory as loaded, used to carry over unknown streams
    pub(crate) metadata: Vec<u8>,
    pub(crate) tables: TablesStream,
    pub(crate) heaps: Heaps,
    pub(crate) type_specs: Vec<Option<TypeSig>>,
    pub(crate) method_specs: Vec<Option<MethodRef>>,
    pub(crate) stand_alone_sigs: Vec<Option<StandAloneSig>>,
    /// `MemberRef` rows whose parent cannot be told apart by value
    pub(crate) ambiguous_member_refs: HashSet<u32>,
}

struct Rows<'a> {
    tables: &'a TablesStream,
    heaps: &'a Heaps,
}

impl<'a> Rows<'a> {
    fn iter(&self, table: TableId) -> impl Iterator<Item = (u32, &'a [u32])> + 'a {
        self.tables.table(table).iter().zip(1u32..).map(|(cells, row)| (row, cells))
    }

    fn count(&self, table: TableId) -> u32 {
        self.tables.rows(table)
    }

    fn cells(&self, table: TableId, row: u32) -> Result<&'a [u32]> {
        self.tables
            .table(table)
            .row(row)
            .ok_or_else(|| malformed_error!("{:?} row {} is out of range", table, row))
    }

    fn string(&self, index: u32) -> Result<String> {
        Ok(self.heaps.strings.get(index)?.to_string())
    }

    fn blob(&self, index: u32) -> Result<&'a [u8]> {
        self.heaps.blobs.get(index)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn short(cell: u32) -> u16 {
    cell as u16
}

fn lookup<'t, T>(rows: &'t [T], row: u32, what: &str) -> Result<&'t T> {
    (row as usize)
        .checked_sub(1)
        .and_then(|index| rows.get(index))
        .ok_or_else(|| malformed_error!("{} row {} is out of range", what, row))
}

/// The 1-based row runs owned by each row of a table, from its `List` column.
fn list_ranges(rows: &Rows<'_>, owner: TableId, column: usize, target: TableId) -> Result<Vec<Range<u32>>> {
    let end = rows.count(target) + 1;
    let starts: Vec<u32> = rows.iter(owner).map(|(_, cells)| cells[column]).collect();

    let mut ranges = Vec::with_capacity(starts.len());
    for (index, start) in starts.iter().enumerate() {
        let next = starts.get(index + 1).copied().unwrap_or(end);
        if *start == 0 || *start > next || next > end {
            return Err(malformed_error!(
                "{:?} row {} owns {:?} rows {}..{} of {}",
                owner,
                index + 1,
                target,
                start,
                next,
                end - 1
            ));
        }
        ranges.push(*start..next);
    }
    Ok(ranges)
}

fn resolve_type_ref(
    rows: &Rows<'_>,
    row: u32,
    assembly_refs: &[AssemblyRef],
    module_refs: &[String],
    resolved: &mut [Option<TypeRef>],
    depth: usize,
) -> Result<TypeRef> {
    if depth > MAX_NESTING {
        return Err(malformed_error!(
            "TypeRef row {} is nested more than {} levels deep",
            row,
            MAX_NESTING
        ));
    }
    if let Some(done) = lookup(resolved, row, "TypeRef")? {
        return Ok(done.clone());
    }

    let cells = rows.cells(TableId::TypeRef, row)?;
    let scope = match CodedIndexType::ResolutionScope.decode(cells[0]) {
        None | Some((_, 0) | (TableId::Module, _)) => ResolutionScope::Module,
        Some((TableId::ModuleRef, scope)) => {
            ResolutionScope::ModuleRef(lookup(module_refs, scope, "ModuleRef")?.clone())
        }
        Some((TableId::AssemblyRef, scope)) => {
            ResolutionScope::Assembly(lookup(assembly_refs, scope, "AssemblyRef")?.name.clone())
        }
        Some((TableId::TypeRef, outer)) => ResolutionScope::Nested(Box::new(resolve_type_ref(
            rows,
            outer,
            assembly_refs,
            module_refs,
            resolved,
            depth + 1,
        )?)),
        Some((other, _)) => {
            return Err(malformed_error!(
                "TypeRef row {} is scoped to {:?}",
                row,
                other
            ))
        }
    };

    let reference = TypeRef::new(scope, rows.string(cells[2])?, rows.string(cells[1])?)
        .with_token(Token::from_parts(table::TYPE_REF, row));
    resolved[row as usize - 1] = Some(reference.clone());
    Ok(reference)
}

fn resolve_type_def(
    rows: &Rows<'_>,
    row: u32,
    enclosing: &HashMap<u32, u32>,
    resolved: &mut [Option<TypeRef>],
    depth: usize,
) -> Result<TypeRef> {
    if depth > MAX_NESTING {
        return Err(malformed_error!(
            "TypeDef row {} is nested more than {} levels deep",
            row,
            MAX_NESTING
        ));
    }
    if let Some(done) = lookup(resolved, row, "TypeDef")? {
        return Ok(done.clone());
    }

    let cells = rows.cells(TableId::TypeDef, row)?;
    let scope = match enclosing.get(&row) {
        Some(outer) => ResolutionScope::Nested(Box::new(resolve_type_def(
            rows,
            *outer,
            enclosing,
            resolved,
            depth + 1,
        )?)),
        None => ResolutionScope::Module,
    };

    let reference = TypeRef::new(scope, rows.string(cells[2])?, rows.string(cells[1])?)
        .with_token(Token::from_parts(table::TYPE_DEF, row));
    resolved[row as usize - 1] = Some(reference.clone());
    Ok(reference)
}

/// Maps the class tokens of signatures to references.
struct SignatureTypes<'a> {
    def_refs: &'a [TypeRef],
    type_refs: &'a [TypeRef],
}

impl SignatureTypes<'_> {
    fn resolve(&self, token: Token) -> Result<TypeRef> {
        let rows = match token.table() {
            table::TYPE_DEF => self.def_refs,
            table::TYPE_REF => self.type_refs,
            other => {
                return Err(malformed_error!(
                    "Token {} of table 0x{:02X} does not name a type",
                    token,
                    other
                ))
            }
        };
        lookup(rows, token.row(), "Type").cloned()
    }
}

/// A method row whose body is decoded once every table is resolved.
struct PendingMethod {
    row: u32,
    rva: u32,
    impl_flags: MethodImplAttributes,
    flags: MethodAttributes,
    name: String,
    signature: MethodSig,
    parameters: Vec<Parameter>,
}

/// Resolves the tokens of method bodies.
struct Resolver<'a> {
    types: &'a SignatureTypes<'a>,
    fields: &'a [FieldRef],
    methods: &'a [MethodRef],
    member_refs: &'a [Option<MemberRef>],
    method_specs: &'a [Option<MethodRef>],
    type_specs: &'a [Option<TypeSig>],
    stand_alone_sigs: &'a [Option<StandAloneSig>],
    user_strings: &'a UserStringHeap,
}

fn decoded<'t, T>(rows: &'t [Option<T>], token: Token) -> Result<&'t T> {
    lookup(rows, token.row(), "Token")?
        .as_ref()
        .ok_or_else(|| malformed_error!("Token {} refers to a row that could not be decoded", token))
}

impl TokenResolver for Resolver<'_> {
    fn resolve(&self, operand_type: OperandType, token: Token) -> Result<Operand> {
        let operand = match token.table() {
            table::USER_STRING => Operand::String(self.user_strings.get(token.row())?),
            table::FIELD => Operand::Field(lookup(self.fields, token.row(), "Field")?.clone()),
            table::METHOD_DEF => {
                Operand::Method(lookup(self.methods, token.row(), "MethodDef")?.clone())
            }
            table::MEMBER_REF => match decoded(self.member_refs, token)? {
                MemberRef::Field(field) => Operand::Field(field.clone()),
                MemberRef::Method(method) => Operand::Method(method.clone()),
            },
            table::METHOD_SPEC => Operand::Method(decoded(self.method_specs, token)?.clone()),
            table::TYPE_DEF | table::TYPE_REF => Operand::Type(self.types.resolve(token)?),
            table::TYPE_SPEC => Operand::TypeSig(decoded(self.type_specs, token)?.clone()),
            table::STAND_ALONE_SIG => match decoded(self.stand_alone_sigs, token)? {
                StandAloneSig::Method(signature) => Operand::CallSite(signature.clone()),
                StandAloneSig::Locals(_) => {
                    return Err(malformed_error!(
                        "Local variable signature {} used as a call site",
                        token
                    ))
                }
            },
            other => {
                return Err(malformed_error!(
                    "Token {} of unexpected table 0x{:02X}",
                    token,
                    other
                ))
            }
        };

        let expected = matches!(
            (operand_type, &operand),
            (OperandType::InlineString, Operand::String(_))
                | (OperandType::InlineField, Operand::Field(_))
                | (OperandType::InlineMethod, Operand::Method(_))
                | (OperandType::InlineType, Operand::Type(_) | Operand::TypeSig(_))
                | (OperandType::InlineSig, Operand::CallSite(_))
                | (
                    OperandType::InlineTok,
                    Operand::Field(_) | Operand::Method(_) | Operand::Type(_) | Operand::TypeSig(_)
                )
        );
        if !expected {
            return Err(malformed_error!(
                "Token {} does not fit a {:?} operand",
                token,
                operand_type
            ));
        }
        Ok(operand)
    }
}

impl BodyResolver for Resolver<'_> {
    fn local_signature(&self, token: Token) -> Result<Vec<TypeSig>> {
        if token.table() != table::STAND_ALONE_SIG {
            return Err(malformed_error!("Local signature token {} has the wrong table", token));
        }
        match decoded(self.stand_alone_sigs, token)? {
            StandAloneSig::Locals(locals) => Ok(locals.clone()),
            StandAloneSig::Method(_) => Err(malformed_error!(
                "Call site signature {} used as a local variable signature",
                token
            )),
        }
    }
}

/// Loads the model of a managed image.
///
/// # Errors
///
/// Returns [`Error::BinaryFormat`] if the metadata root or its table stream is missing,
/// [`Error::Unsupported`] for uncompressed or unknown tables, and [`Error::Malformed`] /
/// [`Error::OutOfBounds`] for corrupt headers, rows or definition signatures.
pub(crate) fn load(file: File) -> Result<BinaryModel> {
    let (clr_rva, clr_size) = file.clr();
    let cor20_offset = file.rva_to_offset(clr_rva)?;
    let cor20 = Cor20Header::read(file.data_slice(cor20_offset, clr_size as usize)?)?;

    let metadata_offset = file.rva_to_offset(cor20.meta_data_rva)?;
    let metadata = file
        .data_slice(metadata_offset, cor20.meta_data_size as usize)?
        .to_vec();
    let root = Root::read(&metadata)?;
    let (tables, heaps) = Heaps::read(&root, &metadata)?;
    let image = file.into_image();

    let rows = Rows {
        tables: &tables,
        heaps: &heaps,
    };

    let (name, version) = identity(&rows)?;

    let mut assembly_refs = Vec::with_capacity(rows.count(TableId::AssemblyRef) as usize);
    for (_, cells) in rows.iter(TableId::AssemblyRef) {
        let version = Version::new(short(cells[0]), short(cells[1]), short(cells[2]), short(cells[3]));
        assembly_refs.push(AssemblyRef::new(rows.string(cells[6])?, version));
    }

    let module_refs = rows
        .iter(TableId::ModuleRef)
        .map(|(_, cells)| rows.string(cells[0]))
        .collect::<Result<Vec<_>>>()?;

    let mut resolved = vec![None; rows.count(TableId::TypeRef) as usize];
    for row in 1..=rows.count(TableId::TypeRef) {
        resolve_type_ref(&rows, row, &assembly_refs, &module_refs, &mut resolved, 0)?;
    }
    let type_refs: Vec<TypeRef> = resolved.into_iter().flatten().collect();

    let enclosing: HashMap<u32, u32> = rows
        .iter(TableId::NestedClass)
        .map(|(_, cells)| (cells[0], cells[1]))
        .collect();
    let mut resolved = vec![None; rows.count(TableId::TypeDef) as usize];
    for row in 1..=rows.count(TableId::TypeDef) {
        resolve_type_def(&rows, row, &enclosing, &mut resolved, 0)?;
    }
    let def_refs: Vec<TypeRef> = resolved.into_iter().flatten().collect();

    let sig_types = SignatureTypes {
        def_refs: &def_refs,
        type_refs: &type_refs,
    };
    let types_fn = |token: Token| sig_types.resolve(token);

    let field_ranges = list_ranges(&rows, TableId::TypeDef, 4, TableId::Field)?;
    let method_ranges = list_ranges(&rows, TableId::TypeDef, 5, TableId::MethodDef)?;
    let param_ranges = list_ranges(&rows, TableId::MethodDef, 5, TableId::Param)?;

    let mut types = Vec::with_capacity(def_refs.len());
    let mut pending = Vec::with_capacity(def_refs.len());
    let mut fields = Vec::with_capacity(rows.count(TableId::Field) as usize);
    let mut methods = Vec::with_capacity(rows.count(TableId::MethodDef) as usize);
    let mut method_owner = Vec::with_capacity(rows.count(TableId::MethodDef) as usize);

    for ((row, cells), reference) in rows.iter(TableId::TypeDef).zip(&def_refs) {
        let index = row as usize - 1;
        let mut definition = TypeDef::new(
            TypeAttributes::from_bits_retain(cells[0]),
            reference.namespace.clone(),
            reference.name.clone(),
        );
        definition.row = Some(row);
        if let ResolutionScope::Nested(outer) = &reference.scope {
            definition.declaring_type = Some((**outer).clone());
        }

        for field_row in field_ranges[index].clone() {
            let cells = rows.cells(TableId::Field, field_row)?;
            let field_type = field_sig_from_blob(rows.blob(cells[2])?, &types_fn)?;
            let mut field = FieldDef::new(
                FieldAttributes::from_bits_retain(short(cells[0])),
                rows.string(cells[1])?,
                field_type.clone(),
            );
            field.origin = Some(FieldOrigin {
                row: field_row,
                field_type,
            });
            fields.push(field.reference(reference.clone()));
            definition.fields.push(field);
        }

        let mut type_methods = Vec::with_capacity(method_ranges[index].len());
        for method_row in method_ranges[index].clone() {
            let cells = rows.cells(TableId::MethodDef, method_row)?;
            let name = rows.string(cells[3])?;
            let signature = MethodSig::from_blob(rows.blob(cells[4])?, &types_fn)
                .map_err(|error| malformed_error!("Signature of {}::{}: {}", reference.full_name(), name, error))?;

            let param_range = lookup(&param_ranges, method_row, "MethodDef")?.clone();
            let mut parameters = Vec::with_capacity(param_range.len());
            for param_row in param_range {
                let cells = rows.cells(TableId::Param, param_row)?;
                let mut parameter = Parameter::new(short(cells[1]), rows.string(cells[2])?);
                parameter.flags = ParamAttributes::from_bits_retain(short(cells[0]));
                parameter.row = Some(param_row);
                parameters.push(parameter);
            }

            methods.push(
                MethodRef::new(reference.clone(), name.clone(), signature.clone())
                    .with_token(Token::from_parts(table::METHOD_DEF, method_row)),
            );
            method_owner.push(index);
            type_methods.push(PendingMethod {
                row: method_row,
                rva: cells[0],
                impl_flags: MethodImplAttributes::from_bits_retain(short(cells[1])),
                flags: MethodAttributes::from_bits_retain(short(cells[2])),
                name,
                signature,
                parameters,
            });
        }

        types.push(definition);
        pending.push(type_methods);
    }

    let mut type_specs = Vec::with_capacity(rows.count(TableId::TypeSpec) as usize);
    for (row, cells) in rows.iter(TableId::TypeSpec) {
        type_specs.push(
            rows.blob(cells[0])
                .and_then(|blob| type_spec_from_blob(blob, &types_fn))
                .inspect_err(|error| log::warn!("TypeSpec row {row} is not decodable: {error}"))
                .ok(),
        );
    }

    let mut member_refs = Vec::with_capacity(rows.count(TableId::MemberRef) as usize);
    let mut ambiguous_member_refs = HashSet::new();
    for (row, cells) in rows.iter(TableId::MemberRef) {
        // Parents other than plain types collapse to a type that does not identify them.
        if matches!(
            CodedIndexType::MemberRefParent.decode(cells[0]),
            Some((TableId::MethodDef | TableId::TypeSpec, _))
        ) {
            ambiguous_member_refs.insert(row);
        }
        let token = Token::from_parts(table::MEMBER_REF, row);
        match member_ref(&rows, cells, &sig_types, &module_refs, &methods, &type_specs) {
            Ok(MemberRef::Field(field)) => {
                member_refs.push(Some(MemberRef::Field(field.with_token(token))));
            }
            Ok(MemberRef::Method(method)) => {
                member_refs.push(Some(MemberRef::Method(method.with_token(token))));
            }
            Err(error) => {
                log::warn!("MemberRef row {row} is not decodable: {error}");
                member_refs.push(None);
            }
        }
    }

    let mut method_specs = Vec::with_capacity(rows.count(TableId::MethodSpec) as usize);
    for (row, cells) in rows.iter(TableId::MethodSpec) {
        let generic = match CodedIndexType::MethodDefOrRef.decode(cells[0]) {
            Some((TableId::MethodDef, method)) => lookup(&methods, method, "MethodDef").cloned(),
            Some((TableId::MemberRef, member)) => match lookup(&member_refs, member, "MemberRef") {
                Ok(Some(MemberRef::Method(method))) => Ok(method.clone()),
                Ok(_) => Err(malformed_error!("MemberRef row {} is not a method", member)),
                Err(error) => Err(error),
            },
            _ => Err(malformed_error!("MethodSpec row {} has no method", row)),
        };
        let spec = generic.and_then(|method| {
            let args = instantiation_from_blob(rows.blob(cells[1])?, &types_fn)?;
            Ok(method
                .instantiate(args)
                .with_token(Token::from_parts(table::METHOD_SPEC, row)))
        });
        method_specs.push(
            spec.inspect_err(|error| log::warn!("MethodSpec row {row} is not decodable: {error}"))
                .ok(),
        );
    }

    let mut stand_alone_sigs = Vec::with_capacity(rows.count(TableId::StandAloneSig) as usize);
    for (row, cells) in rows.iter(TableId::StandAloneSig) {
        let signature = rows.blob(cells[0]).and_then(|blob| {
            if is_local_sig(blob) {
                local_sig_from_blob(blob, &types_fn).map(StandAloneSig::Locals)
            } else {
                MethodSig::from_blob(blob, &types_fn).map(StandAloneSig::Method)
            }
        });
        stand_alone_sigs.push(
            signature
                .inspect_err(|error| log::warn!("StandAloneSig row {row} is not decodable: {error}"))
                .ok(),
        );
    }

    let resolver = Resolver {
        types: &sig_types,
        fields: &fields,
        methods: &methods,
        member_refs: &member_refs,
        method_specs: &method_specs,
        type_specs: &type_specs,
        stand_alone_sigs: &stand_alone_sigs,
        user_strings: &heaps.user_strings,
    };

    let mut undecoded = 0;
    for (definition, type_methods) in types.iter_mut().zip(pending) {
        for method in type_methods {
            let has_il = method.rva != 0 && method.impl_flags.bits() & CODE_TYPE_MASK == 0;
            let body = if has_il {
                match image
                    .tail_at_rva(method.rva)
                    .and_then(|data| MethodBody::decode(data, &resolver))
                {
                    Ok(body) => Some(body),
                    Err(error) => {
                        log::warn!(
                            "Keeping the body of {}::{} undecoded: {error}",
                            definition.full_name(),
                            method.name
                        );
                        undecoded += 1;
                        None
                    }
                }
            } else {
                None
            };

            let mut loaded = MethodDef::new(method.flags, method.name, method.signature.clone())
                .with_parameters(method.parameters);
            loaded.impl_flags = method.impl_flags;
            definition.methods.push(loaded.loaded(
                MethodOrigin {
                    row: method.row,
                    signature: method.signature,
                    rva: method.rva,
                },
                body,
            ));
        }
    }

    log::debug!(
        "Loaded {name} {version}: {} types, {} type refs, {} member refs, {} undecoded bodies",
        types.len(),
        type_refs.len(),
        member_refs.len(),
        undecoded
    );

    let module = ModuleImage {
        image,
        cor20,
        cor20_offset,
        root,
        metadata,
        tables,
        heaps,
        type_specs,
        method_specs,
        stand_alone_sigs,
        ambiguous_member_refs,
    };

    Ok(BinaryModel::from_parts(
        name,
        version,
        types,
        assembly_refs,
        type_refs,
        member_refs,
        Arc::new(module),
    ))
}

/// Name and version of the `Assembly` row, or the module name of a netmodule.
fn identity(rows: &Rows<'_>) -> Result<(String, Version)> {
    if let Some((_, cells)) = rows.iter(TableId::Assembly).next() {
        let version = Version::new(short(cells[1]), short(cells[2]), short(cells[3]), short(cells[4]));
        return Ok((rows.string(cells[7])?, version));
    }

    let module = match rows.iter(TableId::Module).next() {
        Some((_, cells)) => rows.string(cells[1])?,
        None => return Err(malformed_error!("Metadata has no Module row")),
    };
    let name = match module.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => module,
    };
    Ok((name, Version::default()))
}

fn member_ref(
    rows: &Rows<'_>,
    cells: &[u32],
    types: &SignatureTypes<'_>,
    module_refs: &[String],
    methods: &[MethodRef],
    type_specs: &[Option<TypeSig>],
) -> Result<MemberRef> {
    let declaring_type = match CodedIndexType::MemberRefParent.decode(cells[0]) {
        Some((TableId::TypeDef, row)) => types.resolve(Token::from_parts(table::TYPE_DEF, row))?,
        Some((TableId::TypeRef, row)) => types.resolve(Token::from_parts(table::TYPE_REF, row))?,
        Some((TableId::ModuleRef, row)) => TypeRef::new(
            ResolutionScope::ModuleRef(lookup(module_refs, row, "ModuleRef")?.clone()),
            "",
            MODULE_TYPE_NAME,
        ),
        Some((TableId::MethodDef, row)) => lookup(methods, row, "MethodDef")?.declaring_type.clone(),
        Some((TableId::TypeSpec, row)) => {
            let token = Token::from_parts(table::TYPE_SPEC, row);
            match decoded(type_specs, token)? {
                TypeSig::GenericInst { base, .. } => base.clone().with_token(token),
                other => TypeRef::new(ResolutionScope::Module, "", other.to_string()).with_token(token),
            }
        }
        _ => return Err(malformed_error!("Member reference without a parent")),
    };

    let name = rows.string(cells[1])?;
    let blob = rows.blob(cells[2])?;
    let types_fn = |token: Token| types.resolve(token);
    if is_field_sig(blob) {
        let field_type = field_sig_from_blob(blob, &types_fn)?;
        Ok(MemberRef::Field(FieldRef::new(declaring_type, name, field_type)))
    } else {
        let signature = MethodSig::from_blob(blob, &types_fn)?;
        Ok(MemberRef::Method(MethodRef::new(declaring_type, name, signature)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, OpCode},
        file::{
            builder::{ImageBuilder, TEXT_RVA},
            io::pad_to,
        },
        metadata::{model::BinaryModel, root::DEFAULT_VERSION, streams::StreamHeader},
    };

    /// `Game.Main::Run()` returning immediately, without an `Assembly` row or `#US` heap.
    fn metadata_streams() -> Vec<(String, Vec<u8>)> {
        let mut strings = StringHeap::new();
        let mut blobs = BlobHeap::new();
        let mut guids = GuidHeap::new();
        let mut tables = TablesStream::new();

        let module = strings.add("Game.dll");
        let mvid = guids.add(uguid::Guid::from_bytes([7; 16]));
        tables.table_mut(TableId::Module).push(&[0, module, mvid, 0, 0]);

        let module_type = strings.add(MODULE_TYPE_NAME);
        let main = strings.add("Main");
        let namespace = strings.add("Game");
        tables.table_mut(TableId::TypeDef).push(&[0, module_type, 0, 0, 1, 1]);
        tables.table_mut(TableId::TypeDef).push(&[0x0000_0001, main, namespace, 0, 1, 1]);

        let run = strings.add("Run");
        let signature = blobs.add(&[0x00, 0x00, 0x01]);
        tables
            .table_mut(TableId::MethodDef)
            .push(&[TEXT_RVA, 0, 0x0016, run, signature, 1]);

        vec![
            ("#~".to_string(), tables.write(0).unwrap()),
            ("#Strings".to_string(), strings.data().to_vec()),
            ("#Blob".to_string(), blobs.data().to_vec()),
            ("#GUID".to_string(), guids.data().to_vec()),
            ("#Extra".to_string(), vec![1, 2, 3, 4]),
        ]
    }

    fn image(streams: &[(String, Vec<u8>)]) -> Vec<u8> {
        // Tiny header, `ret`
        let mut text = vec![0x06, 0x2A];
        pad_to(&mut text, 4);
        #[allow(clippy::cast_possible_truncation)]
        let metadata_rva = TEXT_RVA + text.len() as u32;

        let mut root = Root::new(DEFAULT_VERSION);
        root.stream_headers = streams
            .iter()
            .map(|(name, _)| StreamHeader {
                offset: 0,
                size: 0,
                name: name.clone(),
            })
            .collect();
        let metadata = root.write(streams);
        text.extend_from_slice(&metadata);
        pad_to(&mut text, 4);

        #[allow(clippy::cast_possible_truncation)]
        let cor20_offset = text.len() as u32;
        #[allow(clippy::cast_possible_truncation)]
        text.extend_from_slice(&Cor20Header::new(metadata_rva, metadata.len() as u32).write());
        ImageBuilder::new(text).clr_header(cor20_offset).build()
    }

    #[test]
    fn test_load_module_without_assembly() {
        let bytes = image(&metadata_streams());
        let model = BinaryModel::from_mem(bytes.clone()).unwrap();

        assert_eq!(model.name, "Game");
        assert_eq!(model.version, Version::default());
        assert_eq!(model.types.len(), 2);
        assert_eq!(model.types[0].name, MODULE_TYPE_NAME);

        let run = model.method("Game.Main", "Run", 0).unwrap();
        assert!(run.is_static());
        assert!(!run.is_dirty());
        let body = run.body().unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body.instructions[0].opcode, OpCode::Ret);

        assert_eq!(model.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_edit_adds_user_strings_and_keeps_unknown_streams() {
        let mut model = BinaryModel::from_mem(image(&metadata_streams())).unwrap();
        let body = model.method_mut("Main", "Run", 0).unwrap().body_mut().unwrap();
        body.insert(
            0,
            [
                Instruction::new(OpCode::Ldstr, Operand::String("hello".into())),
                Instruction::simple(OpCode::Pop),
            ],
        );

        let reloaded = BinaryModel::from_mem(model.to_bytes().unwrap()).unwrap();
        let body = reloaded.method("Main", "Run", 0).unwrap().body().unwrap();
        assert_eq!(body.instructions[0].operand, Operand::String("hello".into()));
        assert_eq!(body.instructions[2].opcode, OpCode::Ret);

        let module = reloaded.image.as_deref().unwrap();
        assert!(module.root.stream("#US").is_some());
        let extra = module.root.stream("#Extra").unwrap();
        let start = extra.offset as usize;
        assert_eq!(&module.metadata[start..start + extra.size as usize], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_table_stream() {
        let mut streams = metadata_streams();
        streams.retain(|(name, _)| name != "#~");
        assert!(matches!(
            BinaryModel::from_mem(image(&streams)),
            Err(Error::BinaryFormat(_))
        ));
    }

    #[test]
    fn test_uncompressed_table_stream() {
        let mut streams = metadata_streams();
        streams[0].0 = "#-".to_string();
        assert!(matches!(
            BinaryModel::from_mem(image(&streams)),
            Err(Error::Unsupported(_))
        ));
    }
}
