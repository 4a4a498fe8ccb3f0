//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::index::{IndexState, IndexStatus};
use crate::prototype::CatalogEntry;
use crate::query::Neighbor;

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.apply_modifier(UTF8_ROUND_CORNERS);
        Self { table }
    }

    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    pub fn add_cells(mut self, row: Vec<Cell>) -> Self {
        self.table.add_row(row);
        self
    }

    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn state_color(state: IndexState) -> Color {
    match state {
        IndexState::Ready => Color::Green,
        IndexState::Stale => Color::Yellow,
        IndexState::Building => Color::Cyan,
        IndexState::Absent => Color::DarkGrey,
    }
}

/// One row per embedding column with its index lifecycle state.
pub fn status_table(rows: &[(IndexStatus, usize, usize)]) -> String {
    let mut builder = TableBuilder::new().set_headers(vec![
        "Column", "Records", "Embedded", "Index", "Lists", "Indexed", "Changed", "Built",
    ]);
    for (status, records, embedded) in rows {
        builder = builder.add_cells(vec![
            Cell::new(format!("{}.{}", status.table, status.column)),
            Cell::new(records),
            Cell::new(embedded),
            Cell::new(status.state)
                .fg(state_color(status.state))
                .add_attribute(Attribute::Bold),
            Cell::new(status.lists.map_or_else(|| "-".to_string(), |l| l.to_string())),
            Cell::new(status.rows_indexed),
            Cell::new(status.rows_changed),
            Cell::new(
                status
                    .built_at
                    .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
            ),
        ]);
    }
    builder.build()
}

/// The topic catalog, largest topics first.
pub fn catalog_table(entries: &[CatalogEntry]) -> String {
    let mut builder = TableBuilder::new().set_headers(vec!["#", "Prototype", "Topic", "Members"]);
    for (rank, entry) in entries.iter().enumerate() {
        builder = builder.add_row(vec![
            (rank + 1).to_string(),
            entry.key.to_string(),
            entry.topic.clone().unwrap_or_default(),
            entry.member_count.to_string(),
        ]);
    }
    builder.build()
}

/// Ranked search results.
pub fn neighbors_table(neighbors: &[Neighbor]) -> String {
    let mut builder = TableBuilder::new().set_headers(vec!["#", "Record", "Distance"]);
    for (rank, n) in neighbors.iter().enumerate() {
        builder = builder.add_row(vec![
            (rank + 1).to_string(),
            n.id.to_string(),
            format!("{:.6}", n.distance),
        ]);
    }
    builder.build()
}
