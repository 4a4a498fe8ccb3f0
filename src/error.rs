//! Error types for the embedding substrate
//!
//! Structured errors via thiserror. Every variant is scoped to the record,
//! prototype or index that produced it; none of them is fatal to the process.

use std::path::PathBuf;

use thiserror::Error;

use crate::prototype::PrototypeKey;
use crate::vector::{EntityTable, RecordId, VectorError};

/// Main error type for substrate operations
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Contract violations: dimension, non-finite values, undefined distance
    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("Record {id} not found in table '{table}'. Upsert the record before setting its embedding.")]
    RecordNotFound { table: EntityTable, id: RecordId },

    #[error(
        "Not enough rows to build the {table} index: {rows} rows with embeddings, {lists} lists requested"
    )]
    InsufficientData {
        table: EntityTable,
        rows: usize,
        lists: usize,
    },

    #[error("Prototype '{key}' not found. It may have been deleted by an administrator.")]
    PrototypeNotFound { key: PrototypeKey },

    #[error("Prototype '{key}' has no members to remove")]
    EmptyPrototype { key: PrototypeKey },

    #[error("Record {id} in table '{table}' is not assigned to any prototype")]
    NotAMember { table: EntityTable, id: RecordId },

    #[error("Record {id} in table '{table}' has no embedding yet")]
    MissingEmbedding { table: EntityTable, id: RecordId },

    #[error("Index build for '{table}' was cancelled by a newer request")]
    BuildCancelled { table: EntityTable },

    #[error("Index build for '{table}' failed: {reason}")]
    BuildFailed { table: EntityTable, reason: String },

    /// File system errors
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid storage format in '{path}': {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EmbedError {
    /// Stable identifier for programmatic error handling.
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::Vector(VectorError::DimensionMismatch { .. }) => "DIMENSION_MISMATCH",
            Self::Vector(VectorError::NonFiniteValue { .. }) => "NON_FINITE_VALUE",
            Self::Vector(VectorError::InvalidVector(_)) => "INVALID_VECTOR",
            Self::Vector(VectorError::InvalidDimension { .. }) => "INVALID_DIMENSION",
            Self::Vector(VectorError::UnknownTable(_)) => "UNKNOWN_TABLE",
            Self::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            Self::InsufficientData { .. } => "INSUFFICIENT_DATA",
            Self::PrototypeNotFound { .. } => "PROTOTYPE_NOT_FOUND",
            Self::EmptyPrototype { .. } => "EMPTY_PROTOTYPE",
            Self::NotAMember { .. } => "NOT_A_MEMBER",
            Self::MissingEmbedding { .. } => "MISSING_EMBEDDING",
            Self::BuildCancelled { .. } => "BUILD_CANCELLED",
            Self::BuildFailed { .. } => "BUILD_FAILED",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::InvalidFormat { .. } => "INVALID_FORMAT",
            Self::Journal(_) => "JOURNAL_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// True for errors raised before any mutation because the input vector
    /// broke the contract.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::InsufficientData { .. } => vec![
                "Request fewer lists, or wait until more rows are encoded",
                "Queries keep using the previous index or an exact scan meanwhile",
            ],
            Self::PrototypeNotFound { .. } | Self::EmptyPrototype { .. } => vec![
                "Caller state has drifted from the prototypes table",
                "Re-read the prototype before retrying the update",
            ],
            Self::BuildCancelled { .. } => vec!["A newer build request superseded this one"],
            Self::BuildFailed { .. } => vec![
                "The previous index keeps serving; retry with 'embedstore rebuild-index'",
            ],
            Self::InvalidFormat { .. } => vec![
                "Remove the data directory and re-ingest from the system of record",
                "Indexes are derived and are rebuilt automatically",
            ],
            Self::Journal(_) => vec![
                "Run 'embedstore checkpoint' to compact the journal",
                "A torn final line is ignored on replay",
            ],
            Self::Storage { .. } => vec![
                "Check disk space and permissions in the data directory",
            ],
            _ => vec![],
        }
    }
}

/// Result type alias for substrate operations
pub type EmbedResult<T> = Result<T, EmbedError>;

/// Attaches a path to I/O failures.
pub trait IoContext<T> {
    fn with_path(self, path: &std::path::Path) -> EmbedResult<T>;
}

impl<T> IoContext<T> for Result<T, std::io::Error> {
    fn with_path(self, path: &std::path::Path) -> EmbedResult<T> {
        self.map_err(|source| EmbedError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }
}
