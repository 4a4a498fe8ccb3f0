//! K-means clustering for IVF-flat partitioning.
//!
//! Partitions are trained with Lloyd's algorithm over squared Euclidean
//! distance, seeded with K-means++ from a deterministic RNG so rebuilds of the
//! same data produce the same lists.
//!
//! # Algorithm Details
//! - Distance metric: squared L2 (matches the shared vector contract)
//! - Initialization: K-means++
//! - Convergence: no assignment changes, or centroid movement below tolerance
//!
//! # Performance Characteristics
//! - O(n * k * d * iterations) time complexity
//! - O(k * d) space for centroids
//! - Assignment step runs on rayon

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::vector::types::squared_l2;

/// Convergence tolerance for mean centroid movement (squared L2).
const CONVERGENCE_TOLERANCE: f32 = 1e-6;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-12;

/// Tunables for a single clustering run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster centroids, each of the input dimension.
    pub centroids: Vec<Vec<f32>>,

    /// Zero-based list index for each input vector.
    pub assignments: Vec<usize>,

    /// Number of iterations until convergence.
    pub iterations: usize,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ensure vectors are stored before building an index"
    )]
    EmptyVectorSet,

    #[error(
        "Invalid cluster count {k} for {rows} vectors\nSuggestion: Use k between 1 and the number of vectors"
    )]
    InvalidClusterCount { k: usize, rows: usize },

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,

    #[error("Clustering cancelled after {0} iterations")]
    Cancelled(usize),
}

/// Runs K-means over `vectors`.
///
/// `cancel` is polled between iterations; a cancelled run returns
/// [`ClusteringError::Cancelled`] and never partial centroids.
pub fn kmeans_clustering<V>(
    vectors: &[V],
    params: KMeansParams,
    cancel: &CancellationToken,
) -> Result<KMeansResult, ClusteringError>
where
    V: AsRef<[f32]> + Sync,
{
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }

    let k = params.k;
    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount {
            k,
            rows: vectors.len(),
        });
    }

    let dimension = vectors[0].as_ref().len();
    if vectors.iter().any(|v| v.as_ref().len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, k, &mut rng);
    let mut assignments: Vec<usize> = Vec::new();
    let mut iterations = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ClusteringError::Cancelled(iterations));
        }
        iterations += 1;

        let new_assignments: Vec<usize> = vectors
            .par_iter()
            .map(|vector| nearest_centroid(vector.as_ref(), &centroids).0)
            .collect();

        let converged = new_assignments == assignments;
        assignments = new_assignments;

        if converged || iterations >= params.max_iterations.max(1) {
            break;
        }

        let new_centroids = update_centroids(vectors, &assignments, k, dimension, &mut rng);
        let movement = calculate_centroid_movement(&centroids, &new_centroids);
        centroids = new_centroids;

        if movement < CONVERGENCE_TOLERANCE {
            // Final assignment against the settled centroids.
            assignments = vectors
                .par_iter()
                .map(|vector| nearest_centroid(vector.as_ref(), &centroids).0)
                .collect();
            break;
        }
    }

    if iterations >= params.max_iterations {
        tracing::debug!(
            "k-means stopped at the iteration cap ({}) before converging",
            params.max_iterations
        );
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Returns the index of the nearest centroid and its squared distance.
///
/// Ties resolve to the lower index.
pub fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_l2(vector, centroid);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Ranks centroids by distance to `vector`, nearest first.
pub fn rank_centroids(vector: &[f32], centroids: &[Vec<f32>]) -> Vec<usize> {
    let mut order: Vec<(usize, f32)> = centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_l2(vector, c)))
        .collect();
    order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    order.into_iter().map(|(i, _)| i).collect()
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]; zero vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Recomputes centroids as the mean of their assigned vectors.
///
/// Empty lists are reseeded from a random input vector.
fn update_centroids<V: AsRef<[f32]>>(
    vectors: &[V],
    assignments: &[usize],
    k: usize,
    dimension: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let mut sums = vec![vec![0.0f64; dimension]; k];
    let mut sizes = vec![0usize; k];

    for (vector, &cluster) in vectors.iter().zip(assignments.iter()) {
        for (sum, &value) in sums[cluster].iter_mut().zip(vector.as_ref()) {
            *sum += f64::from(value);
        }
        sizes[cluster] += 1;
    }

    sums.into_iter()
        .zip(sizes)
        .map(|(sum, size)| {
            if size == 0 {
                let random_idx = rng.random_range(0..vectors.len());
                vectors[random_idx].as_ref().to_vec()
            } else {
                sum.into_iter().map(|s| (s / size as f64) as f32).collect()
            }
        })
        .collect()
}

/// K-means++ seeding.
///
/// When every remaining point coincides with an existing centroid, the
/// remaining slots are filled with copies; those lists simply stay empty.
fn initialize_centroids_kmeans_plus_plus<V: AsRef<[f32]>>(
    vectors: &[V],
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    let first_idx = rng.random_range(0..vectors.len());
    centroids.push(vectors[first_idx].as_ref().to_vec());

    let mut min_distances: Vec<f32> = vectors
        .iter()
        .map(|v| squared_l2(v.as_ref(), &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = min_distances.iter().sum();
        let next_idx = if total < EPSILON {
            rng.random_range(0..vectors.len())
        } else {
            let target = rng.random::<f32>() * total;
            let mut cumulative = 0.0;
            let mut chosen = vectors.len() - 1;
            for (i, &d) in min_distances.iter().enumerate() {
                cumulative += d;
                if cumulative >= target && d > 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let centroid = vectors[next_idx].as_ref().to_vec();
        for (slot, v) in min_distances.iter_mut().zip(vectors.iter()) {
            *slot = slot.min(squared_l2(v.as_ref(), &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Mean squared movement of centroids between iterations.
fn calculate_centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(o, n)| squared_l2(o, n))
        .sum::<f32>()
        / old.len() as f32
}
