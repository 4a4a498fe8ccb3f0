//! Journal replay after a crash, checkpoints and reopen.

use std::fs::OpenOptions;
use std::io::Write;

use embedstore::journal::JOURNAL_FILE;
use embedstore::{
    EmbedError, EntityTable, IndexState, PrototypeKey, PrototypeMetadata, RecordId, Substrate,
};
use tempfile::TempDir;

use crate::support::{fill, random_vectors, settings_at};

/// Everything observable about a substrate, in a comparable form.
#[derive(Debug, PartialEq)]
struct Observed {
    rows: Vec<(EntityTable, u64, Option<Vec<f32>>, Option<String>)>,
    prototypes: Vec<(String, u64, Option<Vec<f32>>, PrototypeMetadata)>,
}

fn observe(substrate: &Substrate) -> Observed {
    let mut rows = Vec::new();
    for table in EntityTable::ALL {
        let embedded = substrate.store().embeddings(table);
        for id in 0..200u64 {
            let id = RecordId::new(id);
            if !substrate.store().contains(table, id) {
                continue;
            }
            let vector = embedded
                .iter()
                .find(|(rid, _)| *rid == id)
                .map(|(_, e)| e.as_slice().to_vec());
            let membership = substrate
                .store()
                .membership(table, id)
                .unwrap()
                .map(|k| k.to_string());
            rows.push((table, id.get(), vector, membership));
        }
    }
    let prototypes = substrate
        .prototypes()
        .snapshot()
        .into_iter()
        .map(|p| {
            (
                p.key().to_string(),
                p.member_count(),
                p.centroid().map(|c| c.into_inner()),
                p.metadata().clone(),
            )
        })
        .collect();
    Observed { rows, prototypes }
}

/// A mix of every kind of mutation.
fn workload(substrate: &Substrate) {
    let tax = PrototypeKey::for_document_topic("d1", "tax");
    let fees = PrototypeKey::for_document_topic("d1", "fees");
    let doomed = PrototypeKey::from("doomed");

    fill(substrate, EntityTable::Chunks, &random_vectors(20, 4, 42));
    for id in 1..=8u64 {
        substrate
            .assign_record(EntityTable::Chunks, RecordId::new(id), &tax)
            .unwrap();
    }
    substrate
        .reassign_record(EntityTable::Chunks, RecordId::new(2), &fees)
        .unwrap();
    substrate
        .set_embedding(EntityTable::Chunks, RecordId::new(3), Some(vec![9.0; 4]))
        .unwrap();
    substrate
        .set_embedding(EntityTable::Chunks, RecordId::new(4), None)
        .unwrap();
    substrate.remove_record(EntityTable::Chunks, RecordId::new(5)).unwrap();
    substrate
        .unassign_record(EntityTable::Chunks, RecordId::new(6))
        .unwrap();

    substrate
        .upsert_record(EntityTable::Documents, RecordId::new(1), Some(vec![1.0; 4]))
        .unwrap();
    substrate
        .assign_record(EntityTable::Documents, RecordId::new(1), &doomed)
        .unwrap();
    substrate.assign(&doomed, &[3.0; 4]).unwrap();
    substrate.delete_prototype(&doomed).unwrap();

    let mut metadata = PrototypeMetadata::new();
    metadata.insert("owner".into(), serde_json::json!("ops"));
    substrate
        .register_prototype(&fees, None, None, metadata)
        .unwrap();
    substrate.rebuild_topic_rollups(Some(10)).unwrap();
}

#[test]
fn test_crash_replay_restores_state() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        workload(&substrate);
        observe(&substrate)
        // Dropped without a checkpoint
    };

    let reopened = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(observe(&reopened), expected);
    drop(reopened);

    // Replaying the same journal again gives the same state
    let again = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(observe(&again), expected);
}

#[test]
fn test_replay_after_checkpoint_applies_only_newer_entries() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        workload(&substrate);
        let report = substrate.checkpoint().unwrap();
        assert_eq!(report.seq, substrate.last_seq());

        substrate
            .upsert_record(EntityTable::Images, RecordId::new(7), Some(vec![0.5; 4]))
            .unwrap();
        substrate
            .reassign_record(
                EntityTable::Chunks,
                RecordId::new(1),
                &PrototypeKey::for_document_topic("d1", "fees"),
            )
            .unwrap();
        observe(&substrate)
    };

    let reopened = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(observe(&reopened), expected);

    // Checkpoint again and reopen from the snapshot alone
    reopened.checkpoint().unwrap();
    drop(reopened);
    let journal = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
    assert!(journal.trim().is_empty());
    let from_snapshot = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(observe(&from_snapshot), expected);
}

#[test]
fn test_torn_journal_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        workload(&substrate);
        observe(&substrate)
    };

    let mut journal = OpenOptions::new()
        .append(true)
        .open(dir.path().join(JOURNAL_FILE))
        .unwrap();
    journal
        .write_all(br#"{"seq":100000,"op":"upsert","table":"chunks","id":1"#)
        .unwrap();
    drop(journal);

    let reopened = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(observe(&reopened), expected);

    // New writes continue after the last complete entry
    let before = reopened.last_seq();
    reopened
        .upsert_record(EntityTable::Chunks, RecordId::new(150), Some(vec![0.0; 4]))
        .unwrap();
    assert_eq!(reopened.last_seq(), before + 1);
}

#[test]
fn test_corrupt_journal_middle_fails_open() {
    let dir = TempDir::new().unwrap();
    {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        fill(&substrate, EntityTable::Chunks, &random_vectors(3, 4, 1));
    }
    let path = dir.path().join(JOURNAL_FILE);
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    lines[1] = "not json";
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    assert!(matches!(
        Substrate::open(settings_at(dir.path(), 4)),
        Err(EmbedError::Journal(_))
    ));
}

#[test]
fn test_indexes_are_rebuilt_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        fill(&substrate, EntityTable::Chunks, &random_vectors(30, 4, 9));
        substrate.rebuild_index(EntityTable::Chunks, Some(3)).unwrap();
        substrate.checkpoint().unwrap();
    }

    let reopened = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    let status = reopened.index_status(EntityTable::Chunks);
    assert_eq!(status.state, IndexState::Ready);
    assert_eq!(status.lists, Some(3));
    assert_eq!(status.rows_indexed, 30);
    assert_eq!(reopened.index_state(EntityTable::Images), IndexState::Absent);
}

#[test]
fn test_dimension_change_is_refused() {
    let dir = TempDir::new().unwrap();
    {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        fill(&substrate, EntityTable::Chunks, &random_vectors(2, 4, 1));
        substrate.checkpoint().unwrap();
    }
    assert!(matches!(
        Substrate::open(settings_at(dir.path(), 8)),
        Err(EmbedError::Config { .. })
    ));
}

#[test]
fn test_replay_keeps_membership_dropped_on_empty_prototype() {
    let dir = TempDir::new().unwrap();
    let key = PrototypeKey::from("K");
    let id = RecordId::new(1);
    {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        substrate
            .upsert_record(EntityTable::Chunks, id, Some(vec![1.0; 4]))
            .unwrap();
        substrate.assign_record(EntityTable::Chunks, id, &key).unwrap();
        // Empty the prototype behind the record's back
        substrate.unassign(&key, &[1.0; 4]).unwrap();
        substrate
            .set_embedding(EntityTable::Chunks, id, Some(vec![2.0; 4]))
            .unwrap();
        assert_eq!(substrate.store().membership(EntityTable::Chunks, id).unwrap(), None);
    }

    let reopened = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(reopened.store().membership(EntityTable::Chunks, id).unwrap(), None);
    assert_eq!(reopened.prototype(&key).unwrap().member_count(), 0);
    assert_eq!(
        reopened.get_embedding(EntityTable::Chunks, id).unwrap().unwrap().into_inner(),
        vec![2.0; 4]
    );
}

#[test]
fn test_repeated_checkpoint_keeps_rows() {
    let dir = TempDir::new().unwrap();
    {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        fill(&substrate, EntityTable::Chunks, &random_vectors(5, 4, 6));
        let first = substrate.checkpoint().unwrap();
        substrate.rebuild_index(EntityTable::Chunks, Some(1)).unwrap();
        let second = substrate.checkpoint().unwrap();
        assert_eq!(first.seq, second.seq);
    }

    let reopened = Substrate::open(settings_at(dir.path(), 4)).unwrap();
    assert_eq!(reopened.store().record_count(EntityTable::Chunks), 5);
    assert_eq!(reopened.index_status(EntityTable::Chunks).lists, Some(1));
}

#[test]
fn test_missing_checkpoint_snapshot_fails_open() {
    let dir = TempDir::new().unwrap();
    let seq = {
        let substrate = Substrate::open(settings_at(dir.path(), 4)).unwrap();
        fill(&substrate, EntityTable::Chunks, &random_vectors(2, 4, 1));
        substrate.checkpoint().unwrap().seq
    };
    std::fs::remove_dir_all(dir.path().join(format!("snapshot-{seq}"))).unwrap();

    assert!(matches!(
        Substrate::open(settings_at(dir.path(), 4)),
        Err(EmbedError::InvalidFormat { .. })
    ));
}
