use comfy_table::{presets, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// Print `data` as JSON (if `--json`) or call `display_fn` for human-readable output.
pub fn print_output<T: Serialize>(
    data: &T,
    opts: &GlobalOptions,
    display_fn: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if opts.json {
        let json = serde_json::to_string_pretty(data)?;
        println!("{json}");
    } else {
        display_fn(data);
    }
    Ok(())
}

/// Borderless, whitespace-aligned table for terminal output.
pub struct TabWriter {
    table: Table,
}

impl TabWriter {
    /// Create a table with the given headers; an empty list means no header row.
    pub fn new(headers: &[&str]) -> Self {
        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic);
        if !headers.is_empty() {
            table.set_header(headers.to_vec());
        }
        Self { table }
    }

    /// Right-align a column.
    pub fn right(mut self, column: usize) -> Self {
        if let Some(col) = self.table.column_mut(column) {
            col.set_cell_alignment(CellAlignment::Right);
        }
        self
    }

    /// Add a row. Values are given in column order.
    pub fn row(&mut self, values: Vec<String>) {
        self.table.add_row(values);
    }

    /// Print the table to stdout, indented by two spaces.
    pub fn print(&mut self) {
        let last = self.table.column_count().saturating_sub(1);
        for (i, col) in self.table.column_iter_mut().enumerate() {
            col.set_padding((0, if i == last { 0 } else { 2 }));
        }
        for line in self.table.to_string().lines() {
            println!("  {}", line.trim_end());
        }
    }
}
