//! IVF index lifecycle: insufficient data, builds, drift and concurrent writes.

use embedstore::{
    EmbedError, EntityTable, IndexState, RecordId, SearchOptions, Substrate,
};

use crate::support::{brute_force, fill, ids, random_vectors, settings};

#[test]
fn test_too_few_rows_for_requested_lists() {
    let substrate = Substrate::in_memory(settings(8)).unwrap();
    fill(&substrate, EntityTable::Chunks, &random_vectors(10, 8, 1));

    let err = substrate
        .rebuild_index(EntityTable::Chunks, Some(100))
        .unwrap_err();
    assert!(matches!(
        err,
        EmbedError::InsufficientData {
            rows: 10,
            lists: 100,
            ..
        }
    ));
    assert_eq!(substrate.index_state(EntityTable::Chunks), IndexState::Absent);

    let status = substrate.rebuild_index(EntityTable::Chunks, Some(2)).unwrap();
    assert_eq!(status.state, IndexState::Ready);
    assert_eq!(status.lists, Some(2));
    assert_eq!(status.rows_indexed, 10);
}

#[test]
fn test_empty_table_cannot_be_indexed() {
    let substrate = Substrate::in_memory(settings(8)).unwrap();
    substrate
        .upsert_record(EntityTable::Images, RecordId::new(1), None)
        .unwrap();
    assert!(matches!(
        substrate.rebuild_index(EntityTable::Images, None),
        Err(EmbedError::InsufficientData { rows: 0, .. })
    ));
}

#[test]
fn test_exact_search_matches_brute_force() {
    let substrate = Substrate::in_memory(settings(16)).unwrap();
    fill(&substrate, EntityTable::Documents, &random_vectors(300, 16, 7));
    substrate.rebuild_index(EntityTable::Documents, Some(8)).unwrap();

    for query in random_vectors(5, 16, 99) {
        let result = substrate
            .search(EntityTable::Documents, &query, 10, SearchOptions::exact())
            .unwrap();
        assert_eq!(
            ids(&result),
            brute_force(&substrate, EntityTable::Documents, &query, 10)
        );
        assert!(result.windows(2).all(|w| w[0].distance <= w[1].distance));
    }
}

#[test]
fn test_full_probe_search_equals_exact_search() {
    let mut settings = settings(8);
    settings.index.probes = 4;
    let substrate = Substrate::in_memory(settings).unwrap();
    fill(&substrate, EntityTable::Chunks, &random_vectors(120, 8, 3));
    substrate.rebuild_index(EntityTable::Chunks, Some(4)).unwrap();

    let query = random_vectors(1, 8, 1234).remove(0);
    let approximate = substrate
        .search(EntityTable::Chunks, &query, 15, SearchOptions::default())
        .unwrap();
    let exact = substrate
        .search(EntityTable::Chunks, &query, 15, SearchOptions::exact())
        .unwrap();
    assert_eq!(approximate, exact);
}

#[test]
fn test_stale_index_never_omits_rows() {
    let mut settings = settings(8);
    settings.index.probes = 4;
    settings.index.drift_threshold = 5;
    settings.index.auto_rebuild = false;
    let substrate = Substrate::in_memory(settings).unwrap();

    let before = random_vectors(60, 8, 11);
    fill(&substrate, EntityTable::KnowledgeCandidates, &before);
    substrate
        .rebuild_index(EntityTable::KnowledgeCandidates, Some(4))
        .unwrap();

    // Move some rows far away and add new ones past the drift threshold
    for id in 1..=10u64 {
        substrate
            .set_embedding(
                EntityTable::KnowledgeCandidates,
                RecordId::new(id),
                Some(vec![50.0 + id as f32; 8]),
            )
            .unwrap();
    }
    for id in 61..=70u64 {
        substrate
            .upsert_record(
                EntityTable::KnowledgeCandidates,
                RecordId::new(id),
                Some(vec![-(id as f32); 8]),
            )
            .unwrap();
    }
    assert_eq!(
        substrate.index_state(EntityTable::KnowledgeCandidates),
        IndexState::Stale
    );
    assert!(substrate.run_maintenance().is_empty());

    let query = vec![0.0; 8];
    let all = substrate
        .search(EntityTable::KnowledgeCandidates, &query, 70, SearchOptions::default())
        .unwrap();
    let mut found = ids(&all);
    found.sort_unstable();
    assert_eq!(found, (1..=70).collect::<Vec<_>>());

    // Distances come from the current vectors, not the indexed snapshot
    let moved = all.iter().find(|n| n.id == RecordId::new(1)).unwrap();
    assert_eq!(moved.distance, 51.0f32 * 51.0 * 8.0);
}

#[test]
fn test_removed_rows_disappear_from_index_results() {
    let mut settings = settings(4);
    settings.index.probes = 2;
    let substrate = Substrate::in_memory(settings).unwrap();
    fill(&substrate, EntityTable::Images, &random_vectors(20, 4, 5));
    substrate.rebuild_index(EntityTable::Images, Some(2)).unwrap();

    substrate.remove_record(EntityTable::Images, RecordId::new(3)).unwrap();
    let result = substrate
        .search(EntityTable::Images, &[0.0; 4], 20, SearchOptions::default())
        .unwrap();
    assert_eq!(result.len(), 19);
    assert!(result.iter().all(|n| n.id != RecordId::new(3)));
}

#[test]
fn test_maintenance_rebuilds_stale_index() {
    let substrate = Substrate::in_memory(settings(4)).unwrap();
    fill(&substrate, EntityTable::Chunks, &random_vectors(40, 4, 8));
    substrate.rebuild_index(EntityTable::Chunks, Some(3)).unwrap();

    for (i, v) in random_vectors(9, 4, 21).into_iter().enumerate() {
        substrate
            .upsert_record(EntityTable::Chunks, RecordId::new(100 + i as u64), Some(v))
            .unwrap();
    }
    assert_eq!(substrate.index_state(EntityTable::Chunks), IndexState::Stale);

    let results = substrate.run_maintenance();
    assert_eq!(results.len(), 1);
    let status = results[0].1.as_ref().unwrap();
    assert_eq!(status.state, IndexState::Ready);
    // Explicit list counts are reused
    assert_eq!(status.lists, Some(3));
    assert_eq!(status.rows_indexed, 49);
    assert_eq!(status.rows_changed, 0);
}

#[test]
fn test_writes_during_background_build_stay_visible() {
    let mut settings = settings(8);
    settings.index.probes = 4;
    let substrate = Substrate::in_memory(settings).unwrap();
    fill(&substrate, EntityTable::Documents, &random_vectors(400, 8, 17));

    let handle = substrate
        .spawn_rebuild(EntityTable::Documents, Some(4))
        .unwrap();
    for id in 401..=420u64 {
        substrate
            .upsert_record(EntityTable::Documents, RecordId::new(id), Some(vec![id as f32; 8]))
            .unwrap();
    }
    let status = handle.wait().unwrap();
    assert!(status.rows_indexed >= 400);

    let query = vec![420.0; 8];
    let result = substrate
        .search(EntityTable::Documents, &query, 1, SearchOptions::default())
        .unwrap();
    assert_eq!(result[0].id, RecordId::new(420));
    assert_eq!(result[0].distance, 0.0);
}

#[test]
fn test_newer_build_supersedes_older() {
    let substrate = Substrate::in_memory(settings(8)).unwrap();
    fill(&substrate, EntityTable::Chunks, &random_vectors(2000, 8, 2));

    let first = substrate.spawn_rebuild(EntityTable::Chunks, Some(16)).unwrap();
    let second = substrate.spawn_rebuild(EntityTable::Chunks, Some(4)).unwrap();

    // The first build either finished before being superseded or reports
    // the cancellation; it never overrides the second.
    let _ = first.wait();
    let status = second.wait().unwrap();
    assert_eq!(status.lists, Some(4));
    assert_eq!(substrate.index_status(EntityTable::Chunks).lists, Some(4));
    assert_eq!(substrate.index_state(EntityTable::Chunks), IndexState::Ready);
}
