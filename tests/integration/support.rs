//! Shared fixtures for the integration tests.

use std::path::Path;

use embedstore::vector::squared_l2;
use embedstore::{EntityTable, Neighbor, RecordId, Settings, Substrate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn settings(dimension: usize) -> Settings {
    let mut settings = Settings::default();
    settings.vector.dimension = dimension;
    settings.index.build_threads = 2;
    settings.index.drift_threshold = 8;
    settings
}

pub fn settings_at(dir: &Path, dimension: usize) -> Settings {
    let mut settings = settings(dimension);
    settings.storage.data_dir = dir.to_path_buf();
    settings
}

pub fn random_vectors(count: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect()
}

/// Upserts `vectors` as records `1..=n` of `table`.
pub fn fill(substrate: &Substrate, table: EntityTable, vectors: &[Vec<f32>]) {
    for (i, v) in vectors.iter().enumerate() {
        substrate
            .upsert_record(table, RecordId::new(i as u64 + 1), Some(v.clone()))
            .unwrap();
    }
}

/// Reference ranking by squared L2, ties by id.
pub fn brute_force(substrate: &Substrate, table: EntityTable, query: &[f32], k: usize) -> Vec<u64> {
    let mut scored: Vec<(f32, u64)> = substrate
        .store()
        .embeddings(table)
        .into_iter()
        .map(|(id, e)| (squared_l2(e.as_slice(), query), id.get()))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}

pub fn ids(result: &[Neighbor]) -> Vec<u64> {
    result.iter().map(|n| n.id.get()).collect()
}
