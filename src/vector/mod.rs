//! Shared vector contract and the numeric kernels built on it.
//!
//! Every embedding column and every prototype centroid uses the same
//! [`VectorContract`]: a fixed dimension (384 by default) and squared
//! Euclidean distance. The clustering kernel here trains the partitions used
//! by the IVF-flat indexes in [`crate::index`].

mod clustering;
mod types;

pub use clustering::{
    ClusteringError, KMeansParams, KMeansResult, cosine_similarity, kmeans_clustering,
    nearest_centroid, rank_centroids,
};
pub use types::{
    DistanceMetric, Embedding, EntityTable, RecordId, VECTOR_DIMENSION_384, VectorContract,
    VectorDimension, VectorError, squared_l2,
};
