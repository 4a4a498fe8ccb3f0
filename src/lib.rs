//! Embedding schema and index manager.
//!
//! Five entity tables share one vector contract. Each embedding column gets
//! an IVF-flat index with an explicit lifecycle, and topic prototypes keep
//! running-mean centroids that route searches to the relevant members.
//! [`Substrate`] ties the pieces together behind a write-ahead journal.

pub mod config;
pub mod display;
pub mod error;
pub mod exit_code;
pub mod index;
pub mod journal;
pub mod logging;
pub mod persistence;
pub mod prototype;
pub mod query;
pub mod store;
pub mod substrate;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{EmbedError, EmbedResult};
pub use index::{BuildHandle, IndexMaintainer, IndexState, IndexStatus, IvfIndex};
pub use prototype::{Prototype, PrototypeAggregator, PrototypeKey, PrototypeMetadata};
pub use query::{Neighbor, QueryService, RouteOptions, SearchOptions};
pub use store::EmbeddingStore;
pub use substrate::{CheckpointReport, RollupReport, Substrate};
pub use vector::{
    DistanceMetric, Embedding, EntityTable, RecordId, VECTOR_DIMENSION_384, VectorContract,
    VectorDimension, VectorError,
};
