//! Type-safe wrappers and core types for the shared vector contract.
//!
//! Every embedding column and every prototype centroid goes through the same
//! [`VectorContract`]: one dimension, one distance metric. Newtypes here keep
//! record ids, tables and validated embeddings from being mixed up with raw
//! primitives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard embedding dimension (all-MiniLM-L6-v2 sized vectors).
pub const VECTOR_DIMENSION_384: usize = 384;

/// Primary key of an entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five entity tables that carry an embedding column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Chunks,
    GraphNodes,
    KnowledgeCandidates,
    Images,
    Documents,
}

impl EntityTable {
    /// All tables, in storage order.
    pub const ALL: [EntityTable; 5] = [
        EntityTable::Chunks,
        EntityTable::GraphNodes,
        EntityTable::KnowledgeCandidates,
        EntityTable::Images,
        EntityTable::Documents,
    ];

    /// Relational table name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Chunks => "chunks",
            Self::GraphNodes => "graph_nodes",
            Self::KnowledgeCandidates => "knowledge_candidates",
            Self::Images => "images",
            Self::Documents => "documents",
        }
    }

    /// Name of the embedding column owned by this table. The width comes
    /// from the shared contract, so the name does not carry it.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        "embedding"
    }

    /// Dense index used for per-table arrays.
    #[must_use]
    pub const fn ordinal(&self) -> usize {
        match self {
            Self::Chunks => 0,
            Self::GraphNodes => 1,
            Self::KnowledgeCandidates => 2,
            Self::Images => 3,
            Self::Documents => 4,
        }
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityTable {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunks" => Ok(Self::Chunks),
            "graph" | "graph_nodes" => Ok(Self::GraphNodes),
            "kc" | "knowledge_candidates" => Ok(Self::KnowledgeCandidates),
            "images" => Ok(Self::Images),
            "docs" | "documents" => Ok(Self::Documents),
            other => Err(VectorError::UnknownTable(other.to_string())),
        }
    }
}

/// Distance semantics shared by every column. Only L2 is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    L2,
}

/// Type-safe wrapper for vector dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Creates a standard 384-dimensional vector dimension.
    #[must_use]
    pub const fn dimension_384() -> Self {
        Self(VECTOR_DIMENSION_384)
    }

    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl TryFrom<usize> for VectorDimension {
    type Error = VectorError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VectorDimension> for usize {
    fn from(value: VectorDimension) -> Self {
        value.0
    }
}

/// A vector that has passed [`VectorContract::validate`].
///
/// Only the contract hands these out, so holding an `Embedding` means the
/// length and finiteness checks already happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wraps values that are known to satisfy the contract (centroids
    /// computed from validated members, segment rows written by us).
    pub(crate) fn from_trusted(values: Vec<f32>) -> Self {
        Self(values)
    }
}

impl AsRef<[f32]> for Embedding {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}

/// The single vector contract shared by all tables and prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorContract {
    dimension: VectorDimension,
    metric: DistanceMetric,
}

impl VectorContract {
    #[must_use]
    pub const fn new(dimension: VectorDimension) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::L2,
        }
    }

    #[must_use]
    pub const fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub const fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Accepts iff the length equals the configured dimension and every
    /// element is finite.
    pub fn validate(&self, vector: &[f32]) -> Result<(), VectorError> {
        self.dimension.validate_vector(vector)?;
        if let Some((index, value)) = vector
            .iter()
            .copied()
            .enumerate()
            .find(|(_, v)| !v.is_finite())
        {
            return Err(VectorError::NonFiniteValue { index, value });
        }
        Ok(())
    }

    /// Validates and wraps a raw vector.
    pub fn embedding(&self, vector: Vec<f32>) -> Result<Embedding, VectorError> {
        self.validate(&vector)?;
        Ok(Embedding(vector))
    }

    /// A zero vector of the contracted dimension.
    #[must_use]
    pub fn zeros(&self) -> Embedding {
        Embedding(vec![0.0; self.dimension.get()])
    }

    /// Squared Euclidean distance between two raw vectors.
    ///
    /// Both operands must pass [`validate`](Self::validate); otherwise the
    /// distance is undefined and `InvalidVector` is returned.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
        self.validate(a)
            .and_then(|()| self.validate(b))
            .map_err(|e| VectorError::InvalidVector(e.to_string()))?;
        Ok(squared_l2(a, b))
    }
}

/// Squared Euclidean distance. Callers guarantee equal lengths.
#[inline]
#[must_use]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Errors raised by the vector contract.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(
        "Non-finite value {value} at position {index}\nSuggestion: Check the encoder output for NaN or infinite values"
    )]
    NonFiniteValue { index: usize, value: f32 },

    #[error("Invalid vector: {0}\nSuggestion: Validate both operands before computing distances")]
    InvalidVector(String),

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error(
        "Unknown table '{0}'\nSuggestion: Use one of chunks, graph_nodes, knowledge_candidates, images, documents"
    )]
    UnknownTable(String),
}
