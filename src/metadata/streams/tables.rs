//! The compressed metadata tables stream `#~` (ECMA-335 II.24.2.6).
//!
//! The header is followed by one `u32` row count per present table and then the rows of every
//! present table, in table id order. Cell widths depend on the row counts and the `HeapSizes`
//! byte, so a stream is decoded into plain `u32` cells and re-encoded with widths recomputed
//! from the final row counts.

use strum::IntoEnumIterator;

use crate::{
    file::io::{pad_to, read_le_at, write_le_to},
    metadata::tables::{columns, Column, TableId, TableInfo, TABLE_COUNT},
    Error, Result,
};

/// `HeapSizes` bit announcing an extra `u32` after the row counts.
const HEAP_EXTRA_DATA: u8 = 0x40;

/// Sorted bits of the tables a compiler emits sorted.
const DEFAULT_SORTED: u64 = 0x0000_1600_3301_FA00;

/// The rows of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    columns: &'static [Column],
    cells: Vec<u32>,
}

impl RawTable {
    fn new(table: TableId) -> Self {
        RawTable {
            columns: columns(table),
            cells: Vec::new(),
        }
    }

    /// The column layout.
    #[must_use]
    pub fn columns(&self) -> &'static [Column] {
        self.columns
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let rows = (self.cells.len() / self.columns.len()) as u32;
        rows
    }

    /// Returns `true` for an empty table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The cells of the 1-based `row`.
    #[must_use]
    pub fn row(&self, row: u32) -> Option<&[u32]> {
        let width = self.columns.len();
        let start = (row as usize).checked_sub(1)? * width;
        self.cells.get(start..start + width)
    }

    /// Mutable cells of the 1-based `row`.
    pub fn row_mut(&mut self, row: u32) -> Option<&mut [u32]> {
        let width = self.columns.len();
        let start = (row as usize).checked_sub(1)? * width;
        self.cells.get_mut(start..start + width)
    }

    /// Iterates the rows in order.
    pub fn iter(&self) -> impl Iterator<Item = &[u32]> {
        self.cells.chunks_exact(self.columns.len())
    }

    /// Appends a row and returns its 1-based number.
    ///
    /// # Panics
    ///
    /// Panics if `cells` does not have one value per column.
    pub fn push(&mut self, cells: &[u32]) -> u32 {
        assert_eq!(cells.len(), self.columns.len(), "row width");
        self.cells.extend_from_slice(cells);
        self.rows()
    }

    /// Replaces all rows.
    pub(crate) fn set_rows(&mut self, rows: Vec<Vec<u32>>) {
        self.cells = rows.into_iter().flatten().collect();
    }

    /// Mutable access to every cell.
    pub(crate) fn cells_mut(&mut self) -> impl Iterator<Item = (Column, &mut u32)> {
        let columns = self.columns;
        self.cells
            .iter_mut()
            .enumerate()
            .map(move |(index, cell)| (columns[index % columns.len()], cell))
    }
}

/// A decoded `#~` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablesStream {
    /// Reserved leading `u32`
    pub reserved: u32,
    /// Schema major version
    pub major_version: u8,
    /// Schema minor version
    pub minor_version: u8,
    /// `HeapSizes` as loaded
    pub heap_sizes: u8,
    /// Reserved byte after `HeapSizes`
    pub reserved2: u8,
    /// Tables present when loaded, empty or not
    pub valid: u64,
    /// Tables flagged as sorted
    pub sorted: u64,
    /// The extra `u32` some producers emit after the row counts
    pub extra: Option<u32>,
    tables: Vec<RawTable>,
}

impl Default for TablesStream {
    fn default() -> Self {
        TablesStream::new()
    }
}

impl TablesStream {
    /// An empty stream of schema version 2.0.
    #[must_use]
    pub fn new() -> Self {
        TablesStream {
            reserved: 0,
            major_version: 2,
            minor_version: 0,
            heap_sizes: 0,
            reserved2: 1,
            valid: 0,
            sorted: DEFAULT_SORTED,
            extra: None,
            tables: TableId::iter().map(RawTable::new).collect(),
        }
    }

    /// Decodes a stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] for unknown tables or populated pointer tables, and
    /// [`Error::OutOfBounds`] for truncated data.
    pub fn read(data: &[u8]) -> Result<TablesStream> {
        let mut offset = 0;
        let mut stream = TablesStream::new();
        stream.reserved = read_le_at::<u32>(data, &mut offset)?;
        stream.major_version = read_le_at::<u8>(data, &mut offset)?;
        stream.minor_version = read_le_at::<u8>(data, &mut offset)?;
        stream.heap_sizes = read_le_at::<u8>(data, &mut offset)?;
        stream.reserved2 = read_le_at::<u8>(data, &mut offset)?;
        stream.valid = read_le_at::<u64>(data, &mut offset)?;
        stream.sorted = read_le_at::<u64>(data, &mut offset)?;

        if stream.valid >> TABLE_COUNT != 0 {
            return Err(Error::Unsupported(format!(
                "metadata tables beyond 0x{:02X} (valid mask 0x{:016X})",
                TABLE_COUNT - 1,
                stream.valid
            )));
        }

        let mut rows = [0u32; TABLE_COUNT];
        for table in TableId::iter() {
            if stream.valid & (1 << table.index()) != 0 {
                rows[table.index()] = read_le_at::<u32>(data, &mut offset)?;
            }
        }
        if stream.heap_sizes & HEAP_EXTRA_DATA != 0 {
            stream.extra = Some(read_le_at::<u32>(data, &mut offset)?);
        }

        let info = TableInfo::new(rows, stream.heap_sizes);
        for table in TableId::iter() {
            let count = rows[table.index()];
            if count == 0 {
                continue;
            }
            if table.is_pointer() {
                return Err(Error::Unsupported(format!("populated {table:?} table")));
            }

            let row_size = info.row_size(table);
            let needed = (count as usize).checked_mul(row_size).ok_or_else(|| out_of_bounds_error!())?;
            if offset.checked_add(needed).map_or(true, |end| end > data.len()) {
                return Err(malformed_error!(
                    "{:?} table of {} rows runs past the tables stream",
                    table,
                    count
                ));
            }

            let raw = &mut stream.tables[table.index()];
            raw.cells.reserve(count as usize * raw.columns.len());
            for _ in 0..count {
                for column in raw.columns {
                    let cell = match info.column_bytes(*column) {
                        2 => u32::from(read_le_at::<u16>(data, &mut offset)?),
                        _ => read_le_at::<u32>(data, &mut offset)?,
                    };
                    raw.cells.push(cell);
                }
            }
        }

        Ok(stream)
    }

    /// The rows of `table`.
    #[must_use]
    pub fn table(&self, table: TableId) -> &RawTable {
        &self.tables[table.index()]
    }

    /// Mutable rows of `table`.
    pub fn table_mut(&mut self, table: TableId) -> &mut RawTable {
        &mut self.tables[table.index()]
    }

    /// Number of rows of `table`.
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.table(table).rows()
    }

    /// Every table with its rows.
    pub fn tables_mut(&mut self) -> impl Iterator<Item = (TableId, &mut RawTable)> {
        TableId::iter().zip(self.tables.iter_mut())
    }

    /// Cell widths for the current row counts and `heap_sizes`.
    #[must_use]
    pub fn info(&self, heap_sizes: u8) -> TableInfo {
        let mut rows = [0u32; TABLE_COUNT];
        for table in TableId::iter() {
            rows[table.index()] = self.rows(table);
        }
        TableInfo::new(rows, heap_sizes)
    }

    /// Encodes the stream.
    ///
    /// `required_heap_sizes` are the heap flags the final heap sizes need; flags set when the
    /// stream was loaded are kept. Tables that were present stay present even when empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a cell does not fit its column.
    pub fn write(&self, required_heap_sizes: u8) -> Result<Vec<u8>> {
        let heap_sizes = self.heap_sizes | required_heap_sizes;
        let info = self.info(heap_sizes);

        let mut valid = self.valid;
        for table in TableId::iter() {
            if !self.table(table).is_empty() {
                valid |= 1 << table.index();
            }
        }

        let mut buffer = Vec::new();
        write_le_to(&mut buffer, self.reserved);
        write_le_to(&mut buffer, self.major_version);
        write_le_to(&mut buffer, self.minor_version);
        write_le_to(&mut buffer, heap_sizes);
        write_le_to(&mut buffer, self.reserved2);
        write_le_to(&mut buffer, valid);
        write_le_to(&mut buffer, self.sorted);
        for table in TableId::iter() {
            if valid & (1 << table.index()) != 0 {
                write_le_to(&mut buffer, self.rows(table));
            }
        }
        if heap_sizes & HEAP_EXTRA_DATA != 0 {
            write_le_to(&mut buffer, self.extra.unwrap_or_default());
        }

        for table in TableId::iter() {
            let raw = self.table(table);
            for row in raw.iter() {
                for (column, cell) in raw.columns.iter().zip(row) {
                    if info.column_bytes(*column) == 2 {
                        let cell = u16::try_from(*cell).map_err(|_| {
                            malformed_error!("{:?} cell 0x{:X} exceeds its 2-byte column", table, cell)
                        })?;
                        write_le_to(&mut buffer, cell);
                    } else {
                        write_le_to(&mut buffer, *cell);
                    }
                }
            }
        }

        pad_to(&mut buffer, 4);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TablesStream {
        let mut stream = TablesStream::new();
        stream.table_mut(TableId::Module).push(&[0, 1, 1, 0, 0]);
        stream.table_mut(TableId::TypeDef).push(&[0, 10, 0, 0, 1, 1]);
        stream.table_mut(TableId::TypeDef).push(&[0x0010_0001, 19, 14, 5, 1, 1]);
        stream.table_mut(TableId::MethodDef).push(&[0x2050, 0, 0x96, 24, 1, 1]);
        stream
    }

    #[test]
    fn test_write_then_read() {
        let stream = sample();
        let bytes = stream.write(0).unwrap();
        assert_eq!(bytes.len() % 4, 0);
        // Header, 3 row counts, Module (10), 2 TypeDefs (14 each), 1 MethodDef (14)
        assert_eq!(bytes.len(), 24 + 12 + 10 + 28 + 14 + 2);

        let read = TablesStream::read(&bytes).unwrap();
        assert_eq!(read.valid, 0b0100_0101);
        assert_eq!(read.rows(TableId::TypeDef), 2);
        assert_eq!(read.table(TableId::TypeDef).row(2).unwrap(), &[0x0010_0001, 19, 14, 5, 1, 1]);
        assert_eq!(read.table(TableId::MethodDef).row(1).unwrap()[0], 0x2050);
        assert_eq!(read.write(0).unwrap(), bytes);
    }

    #[test]
    fn test_large_heap_indices() {
        let mut stream = sample();
        stream.table_mut(TableId::MethodDef).row_mut(1).unwrap()[3] = 0x1_0000;
        assert!(stream.write(0).is_err());

        let bytes = stream.write(crate::metadata::tables::HEAP_LARGE_STRINGS).unwrap();
        let read = TablesStream::read(&bytes).unwrap();
        assert_eq!(read.heap_sizes, 0x01);
        assert_eq!(read.table(TableId::MethodDef).row(1).unwrap()[3], 0x1_0000);
    }

    #[test]
    fn test_rejected() {
        let mut bytes = sample().write(0).unwrap();
        bytes[15] = 0x80;
        assert!(matches!(TablesStream::read(&bytes), Err(Error::Unsupported(_))));

        let mut stream = sample();
        stream.table_mut(TableId::FieldPtr).push(&[1]);
        let bytes = stream.write(0).unwrap();
        assert!(matches!(TablesStream::read(&bytes), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().write(0).unwrap();
        assert!(TablesStream::read(&bytes[..40]).is_err());
        assert!(TablesStream::read(&bytes[..10]).is_err());
    }
}
