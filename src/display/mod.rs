//! Terminal output for the CLI: a small color theme and comfy-table
//! renderings of index status, the topic catalog and search results.

pub mod tables;
pub mod theme;

pub use tables::{TableBuilder, catalog_table, neighbors_table, status_table};
pub use theme::{THEME, Theme};
