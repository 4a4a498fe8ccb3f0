//! IVF-flat index over one embedding column.
//!
//! Rows are partitioned into lists by K-means; each list keeps only the ids of
//! its rows. Distances are always computed against the vectors currently in
//! the store, so an index never returns a stale distance, only possibly a
//! stale partitioning.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::vector::{
    ClusteringError, Embedding, EntityTable, KMeansParams, RecordId, kmeans_clustering,
    rank_centroids,
};

#[derive(Debug, Clone)]
pub struct IvfIndex {
    table: EntityTable,
    centroids: Vec<Vec<f32>>,
    postings: Vec<Vec<RecordId>>,
    rows: usize,
    built_at: DateTime<Utc>,
}

impl IvfIndex {
    /// Trains `lists` partitions over `rows`.
    ///
    /// The caller guarantees `0 < lists <= rows.len()`.
    pub fn train(
        table: EntityTable,
        rows: &[(RecordId, Embedding)],
        lists: usize,
        max_iterations: usize,
        seed: u64,
        cancel: &CancellationToken,
    ) -> Result<Self, ClusteringError> {
        let vectors: Vec<&[f32]> = rows.iter().map(|(_, e)| e.as_slice()).collect();
        let result = kmeans_clustering(
            &vectors,
            KMeansParams {
                k: lists,
                max_iterations,
                seed,
            },
            cancel,
        )?;

        let mut postings = vec![Vec::new(); lists];
        for ((id, _), &list) in rows.iter().zip(&result.assignments) {
            postings[list].push(*id);
        }

        tracing::debug!(
            "[index] trained {} lists over {} {} rows in {} iterations",
            lists,
            rows.len(),
            table,
            result.iterations
        );

        Ok(Self {
            table,
            centroids: result.centroids,
            postings,
            rows: rows.len(),
            built_at: Utc::now(),
        })
    }

    pub fn table(&self) -> EntityTable {
        self.table
    }

    pub fn lists(&self) -> usize {
        self.centroids.len()
    }

    /// Rows present when the index was built.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Candidate ids from the `probes` lists nearest to `query`, probing
    /// further lists until at least `k` candidates are found or every list
    /// has been visited.
    pub fn candidates(&self, query: &[f32], probes: usize, k: usize) -> Vec<RecordId> {
        self.candidates_where(query, probes, k, |_| true)
    }

    /// Like [`candidates`](Self::candidates), counting only ids accepted by
    /// `keep` towards `k`.
    pub fn candidates_where(
        &self,
        query: &[f32],
        probes: usize,
        k: usize,
        keep: impl Fn(RecordId) -> bool,
    ) -> Vec<RecordId> {
        let mut out = Vec::new();
        for (probed, list) in rank_centroids(query, &self.centroids).into_iter().enumerate() {
            if probed >= probes.max(1) && out.len() >= k {
                break;
            }
            out.extend(self.postings[list].iter().copied().filter(|&id| keep(id)));
        }
        out
    }
}
