//! The metadata table schema (ECMA-335 II.22).
//!
//! Rows are kept as plain `u32` cells, one per column, in the order listed by [`columns`].
//! Heap columns hold heap offsets, index columns hold 1-based rows and coded index columns hold
//! the encoded `row << tag_bits | tag` value. Cell widths are only decided when a table stream
//! is read or written, through [`TableInfo`].
//!
//! # Key Components
//!
//! - [`TableId`] - The tables of an uncompressed `#~` stream, `0x00..=0x2C`
//! - [`Column`] - The kind of one column
//! - [`CodedIndexType`] - Coded index families and their tag layout
//! - [`TableInfo`] - Row counts and heap flags, from which cell widths follow

mod codedindex;
mod tableinfo;

pub use codedindex::CodedIndexType;
pub use tableinfo::{TableInfo, HEAP_LARGE_BLOB, HEAP_LARGE_GUID, HEAP_LARGE_STRINGS};

use strum::{EnumCount, EnumIter, IntoEnumIterator};

/// Identifiers of the metadata tables.
#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Debug, EnumIter, EnumCount, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRVA = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOS = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOS = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

/// Number of tables known to this crate.
pub const TABLE_COUNT: usize = TableId::COUNT;

impl TableId {
    /// The table with the given id byte.
    #[must_use]
    pub fn from_id(id: u8) -> Option<TableId> {
        TableId::iter().find(|table| *table as u8 == id)
    }

    /// The table's position in a [`TABLE_COUNT`] sized array.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` for the indirection tables of unoptimized metadata.
    #[must_use]
    pub fn is_pointer(self) -> bool {
        matches!(
            self,
            TableId::FieldPtr
                | TableId::MethodPtr
                | TableId::ParamPtr
                | TableId::EventPtr
                | TableId::PropertyPtr
        )
    }
}

/// The kind of a table column.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Column {
    /// A 2-byte constant
    U16,
    /// A 4-byte constant
    U32,
    /// An offset into `#Strings`
    Str,
    /// A 1-based index into `#GUID`
    Guid,
    /// An offset into `#Blob`
    Blob,
    /// A row of another table
    Index(TableId),
    /// The first row of a run owned by this row, e.g. `TypeDef.FieldList`
    List(TableId),
    /// A coded index
    Coded(CodedIndexType),
}

use CodedIndexType as C;
use Column::{Blob, Coded, Guid, Index, List, Str, U16, U32};

/// The columns of `table`, in storage order.
#[must_use]
pub fn columns(table: TableId) -> &'static [Column] {
    match table {
        TableId::Module => &[U16, Str, Guid, Guid, Guid],
        TableId::TypeRef => &[Coded(C::ResolutionScope), Str, Str],
        TableId::TypeDef => &[
            U32,
            Str,
            Str,
            Coded(C::TypeDefOrRef),
            List(TableId::Field),
            List(TableId::MethodDef),
        ],
        TableId::FieldPtr => &[Index(TableId::Field)],
        TableId::Field => &[U16, Str, Blob],
        TableId::MethodPtr => &[Index(TableId::MethodDef)],
        TableId::MethodDef => &[U32, U16, U16, Str, Blob, List(TableId::Param)],
        TableId::ParamPtr => &[Index(TableId::Param)],
        TableId::Param => &[U16, U16, Str],
        TableId::InterfaceImpl => &[Index(TableId::TypeDef), Coded(C::TypeDefOrRef)],
        TableId::MemberRef => &[Coded(C::MemberRefParent), Str, Blob],
        // The type byte and its padding byte are kept as one cell.
        TableId::Constant => &[U16, Coded(C::HasConstant), Blob],
        TableId::CustomAttribute => &[
            Coded(C::HasCustomAttribute),
            Coded(C::CustomAttributeType),
            Blob,
        ],
        TableId::FieldMarshal => &[Coded(C::HasFieldMarshal), Blob],
        TableId::DeclSecurity => &[U16, Coded(C::HasDeclSecurity), Blob],
        TableId::ClassLayout => &[U16, U32, Index(TableId::TypeDef)],
        TableId::FieldLayout => &[U32, Index(TableId::Field)],
        TableId::StandAloneSig => &[Blob],
        TableId::EventMap => &[Index(TableId::TypeDef), List(TableId::Event)],
        TableId::EventPtr => &[Index(TableId::Event)],
        TableId::Event => &[U16, Str, Coded(C::TypeDefOrRef)],
        TableId::PropertyMap => &[Index(TableId::TypeDef), List(TableId::Property)],
        TableId::PropertyPtr => &[Index(TableId::Property)],
        TableId::Property => &[U16, Str, Blob],
        TableId::MethodSemantics => &[U16, Index(TableId::MethodDef), Coded(C::HasSemantics)],
        TableId::MethodImpl => &[
            Index(TableId::TypeDef),
            Coded(C::MethodDefOrRef),
            Coded(C::MethodDefOrRef),
        ],
        TableId::ModuleRef => &[Str],
        TableId::TypeSpec => &[Blob],
        TableId::ImplMap => &[U16, Coded(C::MemberForwarded), Str, Index(TableId::ModuleRef)],
        TableId::FieldRVA => &[U32, Index(TableId::Field)],
        TableId::EncLog => &[U32, U32],
        TableId::EncMap => &[U32],
        TableId::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        TableId::AssemblyProcessor => &[U32],
        TableId::AssemblyOS => &[U32, U32, U32],
        TableId::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        TableId::AssemblyRefProcessor => &[U32, Index(TableId::AssemblyRef)],
        TableId::AssemblyRefOS => &[U32, U32, U32, Index(TableId::AssemblyRef)],
        TableId::File => &[U32, Str, Blob],
        TableId::ExportedType => &[U32, U32, Str, Str, Coded(C::Implementation)],
        TableId::ManifestResource => &[U32, U32, Str, Coded(C::Implementation)],
        TableId::NestedClass => &[Index(TableId::TypeDef), Index(TableId::TypeDef)],
        TableId::GenericParam => &[U16, U16, Coded(C::TypeOrMethodDef), Str],
        TableId::MethodSpec => &[Coded(C::MethodDefOrRef), Blob],
        TableId::GenericParamConstraint => {
            &[Index(TableId::GenericParam), Coded(C::TypeDefOrRef)]
        }
    }
}

/// The columns a sorted table is ordered by, primary key first.
///
/// Tables that are not required to be sorted return an empty slice. The order in which these
/// tables are listed by [`SORTED_TABLES`] lets a table that others refer to be sorted before
/// the tables referring to it.
#[must_use]
pub fn sort_key(table: TableId) -> &'static [usize] {
    match table {
        TableId::InterfaceImpl => &[0, 1],
        TableId::Constant => &[1],
        TableId::CustomAttribute => &[0],
        TableId::FieldMarshal => &[0],
        TableId::DeclSecurity => &[1],
        TableId::ClassLayout => &[2],
        TableId::FieldLayout => &[1],
        TableId::MethodSemantics => &[2],
        TableId::MethodImpl => &[0],
        TableId::ImplMap => &[1],
        TableId::FieldRVA => &[1],
        TableId::NestedClass => &[0],
        TableId::GenericParam => &[2, 0],
        TableId::GenericParamConstraint => &[0],
        _ => &[],
    }
}

/// Sorted tables, referenced tables before the tables referring to them.
pub const SORTED_TABLES: [TableId; 14] = [
    TableId::InterfaceImpl,
    TableId::DeclSecurity,
    TableId::GenericParam,
    TableId::GenericParamConstraint,
    TableId::Constant,
    TableId::CustomAttribute,
    TableId::FieldMarshal,
    TableId::ClassLayout,
    TableId::FieldLayout,
    TableId::MethodSemantics,
    TableId::MethodImpl,
    TableId::ImplMap,
    TableId::FieldRVA,
    TableId::NestedClass,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        assert_eq!(TABLE_COUNT, 0x2D);
        assert_eq!(TableId::from_id(0x06), Some(TableId::MethodDef));
        assert_eq!(TableId::from_id(0x2C), Some(TableId::GenericParamConstraint));
        assert_eq!(TableId::from_id(0x2D), None);
        assert!(TableId::ParamPtr.is_pointer());
        assert!(!TableId::Param.is_pointer());
    }

    #[test]
    fn test_schema_is_consistent() {
        for table in TableId::iter() {
            let columns = columns(table);
            assert!(!columns.is_empty(), "{table:?}");
            for key in sort_key(table) {
                assert!(*key < columns.len(), "{table:?}");
            }
        }
        for table in SORTED_TABLES {
            assert!(!sort_key(table).is_empty(), "{table:?}");
        }
    }
}
