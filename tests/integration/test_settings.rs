//! Settings that change substrate behavior end to end.

use embedstore::{EntityTable, RecordId, Settings, Substrate};
use tempfile::TempDir;

use crate::support::{fill, random_vectors, settings_at};

#[test]
fn test_settings_file_drives_substrate() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("settings.toml");
    let data_dir = dir.path().join("data");
    std::fs::write(
        &config_path,
        format!(
            "[vector]\ndimension = 6\n\n[index]\nrows_per_list = 10\nbuild_threads = 1\n\n[storage]\ndata_dir = {:?}\n",
            data_dir.display().to_string()
        ),
    )
    .unwrap();

    let settings = Settings::load_from(&config_path).unwrap();
    let substrate = Substrate::open(settings).unwrap();
    assert_eq!(substrate.contract().dimension().get(), 6);
    assert_eq!(substrate.data_dir(), Some(data_dir.as_path()));

    fill(&substrate, EntityTable::Images, &random_vectors(45, 6, 3));
    // ceil(45 / 10) lists when none are requested
    let status = substrate.rebuild_index(EntityTable::Images, None).unwrap();
    assert_eq!(status.lists, Some(5));
    // Column names do not hard-code a width
    assert_eq!(status.column, "embedding");
}

#[test]
fn test_without_journal_only_checkpoints_survive() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings_at(dir.path(), 2);
    settings.storage.journal = false;

    {
        let substrate = Substrate::open(settings.clone()).unwrap();
        substrate
            .upsert_record(EntityTable::Chunks, RecordId::new(1), Some(vec![1.0, 1.0]))
            .unwrap();
        substrate.checkpoint().unwrap();
        substrate
            .upsert_record(EntityTable::Chunks, RecordId::new(2), Some(vec![2.0, 2.0]))
            .unwrap();
    }

    let reopened = Substrate::open(settings).unwrap();
    assert!(reopened.store().contains(EntityTable::Chunks, RecordId::new(1)));
    assert!(!reopened.store().contains(EntityTable::Chunks, RecordId::new(2)));
}
