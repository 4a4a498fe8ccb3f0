//! Embedding store: one nullable embedding column per entity table.

mod segment;
mod tables;

pub use segment::{SegmentRow, read_segment, segment_path, write_segment};
pub use tables::{EmbeddingStore, Row};
