use crate::metadata::tables::{CodedIndexType, Column, TableId, TABLE_COUNT};

/// Heap size flag for a 4-byte `#Strings` index.
pub const HEAP_LARGE_STRINGS: u8 = 0x01;
/// Heap size flag for a 4-byte `#GUID` index.
pub const HEAP_LARGE_GUID: u8 = 0x02;
/// Heap size flag for a 4-byte `#Blob` index.
pub const HEAP_LARGE_BLOB: u8 = 0x04;

/// Row counts and heap index widths, from which every cell width follows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    rows: [u32; TABLE_COUNT],
    heap_sizes: u8,
}

impl TableInfo {
    /// Creates the info for the given row counts and `HeapSizes` byte.
    #[must_use]
    pub fn new(rows: [u32; TABLE_COUNT], heap_sizes: u8) -> Self {
        TableInfo { rows, heap_sizes }
    }

    /// Rows of `table`.
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.rows[table.index()]
    }

    /// The `HeapSizes` byte.
    #[must_use]
    pub fn heap_sizes(&self) -> u8 {
        self.heap_sizes
    }

    /// Returns `true` if an index into `table` takes 4 bytes.
    #[must_use]
    pub fn is_large(&self, table: TableId) -> bool {
        self.rows(table) > u32::from(u16::MAX)
    }

    /// Width of a `coded` index.
    #[must_use]
    pub fn coded_index_bytes(&self, coded: CodedIndexType) -> usize {
        let max_rows = coded.tables().map(|table| self.rows(table)).max().unwrap_or(0);
        let bits = u32::BITS - max_rows.leading_zeros();
        if bits + coded.tag_bits() > 16 {
            4
        } else {
            2
        }
    }

    /// Width of a cell of `column`.
    #[must_use]
    pub fn column_bytes(&self, column: Column) -> usize {
        let large = |flag: u8| if self.heap_sizes & flag != 0 { 4 } else { 2 };
        match column {
            Column::U16 => 2,
            Column::U32 => 4,
            Column::Str => large(HEAP_LARGE_STRINGS),
            Column::Guid => large(HEAP_LARGE_GUID),
            Column::Blob => large(HEAP_LARGE_BLOB),
            Column::Index(table) | Column::List(table) => {
                if self.is_large(table) {
                    4
                } else {
                    2
                }
            }
            Column::Coded(coded) => self.coded_index_bytes(coded),
        }
    }

    /// Size of one row of `table`.
    #[must_use]
    pub fn row_size(&self, table: TableId) -> usize {
        super::columns(table)
            .iter()
            .map(|column| self.column_bytes(*column))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(entries: &[(TableId, u32)], heap_sizes: u8) -> TableInfo {
        let mut rows = [0; TABLE_COUNT];
        for (table, count) in entries {
            rows[table.index()] = *count;
        }
        TableInfo::new(rows, heap_sizes)
    }

    #[test]
    fn test_small_rows() {
        let info = info(&[(TableId::TypeDef, 10), (TableId::Field, 20)], 0);
        assert_eq!(info.row_size(TableId::Module), 10);
        assert_eq!(info.row_size(TableId::TypeDef), 14);
        assert_eq!(info.row_size(TableId::MethodDef), 14);
        assert_eq!(info.row_size(TableId::CustomAttribute), 6);
    }

    #[test]
    fn test_coded_index_threshold() {
        // 2 tag bits leave 14 bits for the row.
        let small = info(&[(TableId::TypeRef, 0x3FFF)], 0);
        assert_eq!(small.coded_index_bytes(CodedIndexType::TypeDefOrRef), 2);
        let large = info(&[(TableId::TypeRef, 0x4000)], 0);
        assert_eq!(large.coded_index_bytes(CodedIndexType::TypeDefOrRef), 4);
        assert_eq!(large.coded_index_bytes(CodedIndexType::MethodDefOrRef), 2);
    }

    #[test]
    fn test_heap_flags() {
        let info = info(&[], HEAP_LARGE_STRINGS | HEAP_LARGE_BLOB);
        assert_eq!(info.column_bytes(Column::Str), 4);
        assert_eq!(info.column_bytes(Column::Guid), 2);
        assert_eq!(info.column_bytes(Column::Blob), 4);
        assert_eq!(info.row_size(TableId::Field), 10);
    }
}
