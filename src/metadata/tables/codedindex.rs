//! Coded indices (ECMA-335 II.24.2.6).
//!
//! A coded index stores a row of one of several tables in a single value: the low
//! `tag_bits` bits select the table and the remaining bits hold the row.

use crate::metadata::tables::TableId;

/// The coded index families used by the metadata tables.
#[allow(missing_docs)]
#[derive(Debug, Hash, Eq, PartialEq, Clone, Copy)]
pub enum CodedIndexType {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndexType {
    /// The table behind every tag value; unused tags are `None`.
    #[must_use]
    pub fn slots(&self) -> &'static [Option<TableId>] {
        use TableId as T;
        match self {
            CodedIndexType::TypeDefOrRef => &[Some(T::TypeDef), Some(T::TypeRef), Some(T::TypeSpec)],
            CodedIndexType::HasConstant => &[Some(T::Field), Some(T::Param), Some(T::Property)],
            CodedIndexType::HasCustomAttribute => &[
                Some(T::MethodDef),
                Some(T::Field),
                Some(T::TypeRef),
                Some(T::TypeDef),
                Some(T::Param),
                Some(T::InterfaceImpl),
                Some(T::MemberRef),
                Some(T::Module),
                Some(T::DeclSecurity),
                Some(T::Property),
                Some(T::Event),
                Some(T::StandAloneSig),
                Some(T::ModuleRef),
                Some(T::TypeSpec),
                Some(T::Assembly),
                Some(T::AssemblyRef),
                Some(T::File),
                Some(T::ExportedType),
                Some(T::ManifestResource),
                Some(T::GenericParam),
                Some(T::GenericParamConstraint),
                Some(T::MethodSpec),
            ],
            CodedIndexType::HasFieldMarshal => &[Some(T::Field), Some(T::Param)],
            CodedIndexType::HasDeclSecurity => {
                &[Some(T::TypeDef), Some(T::MethodDef), Some(T::Assembly)]
            }
            CodedIndexType::MemberRefParent => &[
                Some(T::TypeDef),
                Some(T::TypeRef),
                Some(T::ModuleRef),
                Some(T::MethodDef),
                Some(T::TypeSpec),
            ],
            CodedIndexType::HasSemantics => &[Some(T::Event), Some(T::Property)],
            CodedIndexType::MethodDefOrRef => &[Some(T::MethodDef), Some(T::MemberRef)],
            CodedIndexType::MemberForwarded => &[Some(T::Field), Some(T::MethodDef)],
            CodedIndexType::Implementation => {
                &[Some(T::File), Some(T::AssemblyRef), Some(T::ExportedType)]
            }
            CodedIndexType::CustomAttributeType => {
                &[None, None, Some(T::MethodDef), Some(T::MemberRef), None]
            }
            CodedIndexType::ResolutionScope => &[
                Some(T::Module),
                Some(T::ModuleRef),
                Some(T::AssemblyRef),
                Some(T::TypeRef),
            ],
            CodedIndexType::TypeOrMethodDef => &[Some(T::TypeDef), Some(T::MethodDef)],
        }
    }

    /// The tables this family can refer to.
    pub fn tables(&self) -> impl Iterator<Item = TableId> {
        self.slots().iter().flatten().copied()
    }

    /// Number of low bits holding the tag.
    #[must_use]
    pub fn tag_bits(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.slots().len() as u32;
        u32::BITS - (count - 1).leading_zeros()
    }

    /// Splits `value` into table and row; `None` for unused tags.
    #[must_use]
    pub fn decode(&self, value: u32) -> Option<(TableId, u32)> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        let table = (*self.slots().get(tag)?)?;
        Some((table, value >> bits))
    }

    /// Combines table and row; `None` if `table` is not part of this family.
    #[must_use]
    pub fn encode(&self, table: TableId, row: u32) -> Option<u32> {
        let tag = self.slots().iter().position(|slot| *slot == Some(table))?;
        #[allow(clippy::cast_possible_truncation)]
        Some((row << self.tag_bits()) | tag as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_bits() {
        assert_eq!(CodedIndexType::TypeDefOrRef.tag_bits(), 2);
        assert_eq!(CodedIndexType::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(CodedIndexType::MemberRefParent.tag_bits(), 3);
        assert_eq!(CodedIndexType::CustomAttributeType.tag_bits(), 3);
        assert_eq!(CodedIndexType::MethodDefOrRef.tag_bits(), 1);
    }

    #[test]
    fn test_encode_decode() {
        let resolution = CodedIndexType::ResolutionScope;
        assert_eq!(resolution.encode(TableId::AssemblyRef, 3), Some(0x0E));
        assert_eq!(resolution.decode(0x0E), Some((TableId::AssemblyRef, 3)));
        assert_eq!(resolution.encode(TableId::Field, 1), None);

        let attribute = CodedIndexType::CustomAttributeType;
        assert_eq!(attribute.encode(TableId::MethodDef, 1), Some(0x0A));
        assert_eq!(attribute.encode(TableId::MemberRef, 2), Some(0x13));
        assert_eq!(attribute.decode(0x08), None);
        assert_eq!(attribute.tables().count(), 2);
    }
}
