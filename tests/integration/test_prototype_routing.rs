//! Prototype centroids, atomic reassignment and routed search.

use std::sync::Arc;
use std::thread;

use embedstore::{
    EmbedError, EntityTable, PrototypeKey, PrototypeMetadata, RecordId, SearchOptions, Substrate,
};

use crate::support::{fill, ids, random_vectors, settings};

fn unit(dimension: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[axis] = 1.0;
    v
}

#[test]
fn test_centroid_is_mean_of_members() {
    let substrate = Substrate::in_memory(settings(384)).unwrap();
    let key = PrototypeKey::from("topicA");
    substrate.assign(&key, &unit(384, 0)).unwrap();
    substrate.assign(&key, &unit(384, 1)).unwrap();

    let prototype = substrate.prototype(&key).unwrap();
    assert_eq!(prototype.member_count(), 2);
    let centroid = prototype.centroid().unwrap().into_inner();
    let mut expected = vec![0.0f32; 384];
    expected[0] = 0.5;
    expected[1] = 0.5;
    assert_eq!(centroid, expected);
}

#[test]
fn test_unassign_last_member_keeps_empty_prototype() {
    let substrate = Substrate::in_memory(settings(4)).unwrap();
    let key = PrototypeKey::for_document_topic("d1", "billing");
    substrate.assign(&key, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    substrate.unassign(&key, &[1.0, 2.0, 3.0, 4.0]).unwrap();

    let prototype = substrate.prototype(&key).unwrap();
    assert_eq!(prototype.member_count(), 0);
    assert!(prototype.centroid().is_none());
    assert_eq!(prototype.topic(), Some("billing"));
    assert_eq!(prototype.document(), Some("d1"));

    assert!(matches!(
        substrate.unassign(&key, &[1.0, 2.0, 3.0, 4.0]),
        Err(EmbedError::EmptyPrototype { .. })
    ));
    assert!(matches!(
        substrate.unassign(&PrototypeKey::from("never"), &[0.0; 4]),
        Err(EmbedError::PrototypeNotFound { .. })
    ));
}

#[test]
fn test_register_prototype_sets_descriptive_fields() {
    let substrate = Substrate::in_memory(settings(4)).unwrap();
    let key = PrototypeKey::from("custom");
    let mut metadata = PrototypeMetadata::new();
    metadata.insert("source".into(), serde_json::json!("manual"));
    substrate
        .register_prototype(&key, Some("refunds".into()), None, metadata)
        .unwrap();

    let prototype = substrate.prototype(&key).unwrap();
    assert_eq!(prototype.member_count(), 0);
    assert_eq!(prototype.topic(), Some("refunds"));
    assert_eq!(prototype.metadata()["source"], "manual");
}

#[test]
fn test_concurrent_record_reassignment_conserves_members() {
    let substrate = Arc::new(Substrate::in_memory(settings(4)).unwrap());
    let a = PrototypeKey::from("A");
    let b = PrototypeKey::from("B");

    for id in 0..40u64 {
        substrate
            .upsert_record(EntityTable::Chunks, RecordId::new(id), Some(vec![id as f32; 4]))
            .unwrap();
        let key = if id % 2 == 0 { &a } else { &b };
        substrate
            .assign_record(EntityTable::Chunks, RecordId::new(id), key)
            .unwrap();
    }

    let workers: Vec<_> = (0..4u64)
        .map(|w| {
            let substrate = Arc::clone(&substrate);
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for round in 0..50u64 {
                    let id = RecordId::new((w * 10 + round) % 40);
                    let to = if round % 2 == 0 { &a } else { &b };
                    substrate
                        .reassign_record(EntityTable::Chunks, id, to)
                        .unwrap();
                    let total: u64 = substrate
                        .member_counts(&[a.clone(), b.clone()])
                        .into_iter()
                        .flatten()
                        .sum();
                    assert_eq!(total, 40);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // Memberships and counts agree
    let in_a = substrate
        .store()
        .members_of(EntityTable::Chunks, &[a.clone()].into_iter().collect())
        .len() as u64;
    assert_eq!(substrate.member_counts(&[a, b]), vec![Some(in_a), Some(40 - in_a)]);
}

#[test]
fn test_reassign_from_missing_prototype_changes_nothing() {
    let substrate = Substrate::in_memory(settings(2)).unwrap();
    let err = substrate
        .reassign(&[1.0, 1.0], &PrototypeKey::from("gone"), &PrototypeKey::from("new"))
        .unwrap_err();
    assert!(matches!(err, EmbedError::PrototypeNotFound { .. }));
    assert!(substrate.prototype(&PrototypeKey::from("new")).is_none());
    assert_eq!(substrate.last_seq(), 0);
}

#[test]
fn test_route_covering_all_prototypes_equals_search() {
    let substrate = Substrate::in_memory(settings(8)).unwrap();
    let vectors = random_vectors(50, 8, 4);
    fill(&substrate, EntityTable::Chunks, &vectors);
    for id in 1..=30u64 {
        let key = PrototypeKey::from(format!("t{}", id % 3));
        substrate
            .assign_record(EntityTable::Chunks, RecordId::new(id), &key)
            .unwrap();
    }

    let query = random_vectors(1, 8, 77).remove(0);
    let plain = substrate
        .search(EntityTable::Chunks, &query, 10, SearchOptions::exact())
        .unwrap();
    for n in [3, 4, 100] {
        let routed = substrate
            .route_then_search(EntityTable::Chunks, &query, 10, Some(n), true)
            .unwrap();
        assert_eq!(routed, plain);
    }
}

#[test]
fn test_route_restricts_to_nearest_prototype_members() {
    let substrate = Substrate::in_memory(settings(2)).unwrap();
    let near = PrototypeKey::from("near");
    let far = PrototypeKey::from("far");
    let rows = [
        (1u64, [0.1, 0.0], &near),
        (2, [0.0, 0.2], &near),
        (3, [10.0, 10.0], &far),
        (4, [10.5, 10.0], &far),
    ];
    for (id, v, key) in rows {
        substrate
            .upsert_record(EntityTable::Images, RecordId::new(id), Some(v.to_vec()))
            .unwrap();
        substrate
            .assign_record(EntityTable::Images, RecordId::new(id), key)
            .unwrap();
    }
    // Unassigned row closest to the query
    substrate
        .upsert_record(EntityTable::Images, RecordId::new(5), Some(vec![0.0, 0.0]))
        .unwrap();

    let routed = substrate
        .route_then_search(EntityTable::Images, &[0.0, 0.0], 10, Some(1), false)
        .unwrap();
    assert_eq!(ids(&routed), vec![1, 2]);

    let plain = substrate
        .search(EntityTable::Images, &[0.0, 0.0], 10, SearchOptions::default())
        .unwrap();
    assert_eq!(ids(&plain), vec![5, 1, 2, 3, 4]);
}

#[test]
fn test_rollups_feed_the_catalog() {
    let substrate = Substrate::in_memory(settings(2)).unwrap();
    for (doc, topic, v) in [
        ("d1", "tax", [1.0, 0.0]),
        ("d2", "tax", [0.0, 1.0]),
        ("d3", "tax", [1.0, 1.0]),
        ("d1", "fees", [2.0, 2.0]),
        ("d2", "fees", [4.0, 4.0]),
        ("d3", "refunds", [0.0, 0.0]),
    ] {
        substrate
            .assign(&PrototypeKey::for_document_topic(doc, topic), &v)
            .unwrap();
    }

    let report = substrate.rebuild_topic_rollups(Some(2)).unwrap();
    let topics: Vec<&str> = report.rollups.iter().map(|r| r.topic.as_str()).collect();
    assert_eq!(topics, vec!["tax", "fees"]);

    let catalog = substrate.catalog(10);
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog[0].key, PrototypeKey::for_topic("tax"));
    assert_eq!(catalog[0].member_count, 3);

    let fees = substrate.prototype(&PrototypeKey::for_topic("fees")).unwrap();
    assert_eq!(fees.centroid().unwrap().into_inner(), vec![3.0, 3.0]);
}

#[test]
fn test_route_ignores_topic_rollups_without_members() {
    let substrate = Substrate::in_memory(settings(2)).unwrap();
    let d1 = PrototypeKey::for_document_topic("d1", "tax");
    let d2 = PrototypeKey::for_document_topic("d2", "tax");
    for (id, v, key) in [(1u64, [1.0, 0.0], &d1), (2, [0.0, 1.0], &d2)] {
        substrate
            .upsert_record(EntityTable::Chunks, RecordId::new(id), Some(v.to_vec()))
            .unwrap();
        substrate
            .assign_record(EntityTable::Chunks, RecordId::new(id), key)
            .unwrap();
    }

    let query = [0.6, 0.5];
    let before = substrate
        .route_then_search(EntityTable::Chunks, &query, 10, Some(1), true)
        .unwrap();
    assert_eq!(ids(&before), vec![1]);

    // The tax rollup sits at [0.5, 0.5], closer than either document
    substrate.rebuild_topic_rollups(None).unwrap();
    assert!(substrate.prototype(&PrototypeKey::for_topic("tax")).is_some());

    let after = substrate
        .route_then_search(EntityTable::Chunks, &query, 10, Some(1), true)
        .unwrap();
    assert_eq!(after, before);
}
