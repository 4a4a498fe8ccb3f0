//! On-disk snapshots of the store and the prototypes table.
//!
//! ```text
//! data_dir/
//!   metadata.json          points at the current snapshot
//!   journal.log            entries newer than the snapshot
//!   snapshot-<seq>/
//!     chunks.vec ... documents.vec
//!     memberships.json
//!     prototypes.json
//! ```
//!
//! A checkpoint fills `snapshot-<seq>.tmp/` and renames it into place, then
//! atomically replaces `metadata.json`, then removes older snapshot
//! directories. The directory `metadata.json` names is never rewritten, so a
//! crash at any point leaves it naming a complete snapshot.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult, IoContext};
use crate::index::IndexDescriptor;
use crate::prototype::{Prototype, PrototypeKey};
use crate::store::{EmbeddingStore, Row, SegmentRow, read_segment, segment_path, write_segment};
use crate::vector::{EntityTable, RecordId, VectorContract};

pub const METADATA_FILE: &str = "metadata.json";
const MEMBERSHIPS_FILE: &str = "memberships.json";
const PROTOTYPES_FILE: &str = "prototypes.json";

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Version of the on-disk format
    pub version: u32,

    /// Embedding width of every stored vector
    pub dimension: usize,

    /// Journal sequence reflected by the snapshot
    pub checkpoint_seq: u64,

    /// Indexes to rebuild on open
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,

    /// Rows per table at checkpoint time, for status output
    #[serde(default)]
    pub row_counts: Vec<(EntityTable, usize)>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoreMetadata {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(dimension: usize) -> Self {
        let now = Utc::now();
        Self {
            version: Self::CURRENT_VERSION,
            dimension,
            checkpoint_seq: 0,
            indexes: Vec::new(),
            row_counts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(METADATA_FILE).exists()
    }

    pub fn load(dir: &Path) -> EmbedResult<Self> {
        let path = dir.join(METADATA_FILE);
        let metadata: Self = read_json(&path)?;
        if metadata.version > Self::CURRENT_VERSION {
            return Err(EmbedError::InvalidFormat {
                path,
                reason: format!(
                    "metadata version {} is newer than supported version {}",
                    metadata.version,
                    Self::CURRENT_VERSION
                ),
            });
        }
        Ok(metadata)
    }

    pub fn save(&self, dir: &Path) -> EmbedResult<()> {
        write_json(&dir.join(METADATA_FILE), self)
    }

    pub fn snapshot_dir(&self, dir: &Path) -> PathBuf {
        snapshot_dir(dir, self.checkpoint_seq)
    }
}

fn snapshot_dir(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("snapshot-{seq}"))
}

fn staging_dir(target: &Path) -> PathBuf {
    target.with_extension("tmp")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Membership {
    table: EntityTable,
    id: RecordId,
    key: PrototypeKey,
}

/// Rows and prototypes captured for one checkpoint.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub tables: Vec<(EntityTable, Vec<(RecordId, Row)>)>,
    pub prototypes: Vec<Prototype>,
}

impl Snapshot {
    /// Copies the store. Take this before the prototype snapshot so that
    /// prototypes are never older than the rows pointing at them.
    pub fn capture_rows(store: &EmbeddingStore) -> Self {
        Self {
            tables: EntityTable::ALL
                .into_iter()
                .map(|table| (table, store.rows(table)))
                .collect(),
            prototypes: Vec::new(),
        }
    }

    /// Writes `snapshot-<seq>/`, then points `metadata.json` at it.
    pub fn write(
        &self,
        dir: &Path,
        contract: &VectorContract,
        metadata: &mut StoreMetadata,
        seq: u64,
    ) -> EmbedResult<()> {
        let target = snapshot_dir(dir, seq);
        if metadata.checkpoint_seq == seq && target.exists() {
            // Nothing was written since the live snapshot; only metadata moves.
            tracing::debug!("[persist] snapshot at seq {seq} is current, updating metadata only");
        } else {
            self.write_dir(&target, contract)?;
        }

        metadata.checkpoint_seq = seq;
        metadata.dimension = contract.dimension().get();
        metadata.row_counts = self
            .tables
            .iter()
            .map(|(table, rows)| (*table, rows.len()))
            .collect();
        metadata.updated_at = Utc::now();
        metadata.save(dir)?;

        remove_stale_snapshots(dir, seq);
        tracing::info!("[persist] wrote snapshot at seq {seq} to {}", target.display());
        Ok(())
    }

    /// Fills `<target>.tmp` and renames it to `target`, so `target` only
    /// ever exists complete.
    fn write_dir(&self, target: &Path, contract: &VectorContract) -> EmbedResult<()> {
        let staging = staging_dir(target);
        if staging.exists() {
            std::fs::remove_dir_all(&staging).with_path(&staging)?;
        }
        std::fs::create_dir_all(&staging).with_path(&staging)?;

        let mut memberships = Vec::new();
        for (table, rows) in &self.tables {
            write_segment(
                &segment_path(&staging, *table),
                contract.dimension(),
                rows.iter().map(|(id, row)| {
                    (*id, row.seq, row.embedding().map(|e| e.as_slice()))
                }),
            )?;
            memberships.extend(rows.iter().filter_map(|(id, row)| {
                row.membership().map(|key| Membership {
                    table: *table,
                    id: *id,
                    key: key.clone(),
                })
            }));
        }
        write_json(&staging.join(MEMBERSHIPS_FILE), &memberships)?;
        write_json(&staging.join(PROTOTYPES_FILE), &self.prototypes)?;

        // A leftover at this seq was never named by metadata.json
        if target.exists() {
            std::fs::remove_dir_all(target).with_path(target)?;
        }
        std::fs::rename(&staging, target).with_path(target)?;
        Ok(())
    }

    /// Loads the snapshot named by `metadata`.
    pub fn read(dir: &Path, contract: &VectorContract, metadata: &StoreMetadata) -> EmbedResult<Self> {
        if metadata.dimension != contract.dimension().get() {
            return Err(EmbedError::Config {
                reason: format!(
                    "data directory holds {}-dimensional vectors but vector.dimension is {}",
                    metadata.dimension,
                    contract.dimension().get()
                ),
            });
        }

        let source = metadata.snapshot_dir(dir);
        if !source.exists() {
            if metadata.checkpoint_seq > 0 {
                return Err(EmbedError::InvalidFormat {
                    path: source,
                    reason: format!(
                        "metadata names the checkpoint at seq {} but its snapshot is missing",
                        metadata.checkpoint_seq
                    ),
                });
            }
            // Fresh data directory: nothing checkpointed yet.
            return Ok(Self::default());
        }

        let memberships: Vec<Membership> = read_json(&source.join(MEMBERSHIPS_FILE))?;
        let mut tables = Vec::new();
        for table in EntityTable::ALL {
            let path = segment_path(&source, table);
            let rows: Vec<SegmentRow> = if path.exists() {
                read_segment(&path, contract)?
            } else {
                Vec::new()
            };
            let mut rows: Vec<(RecordId, Row)> = rows
                .into_iter()
                .map(|r| {
                    (
                        r.id,
                        Row {
                            embedding: r.embedding,
                            membership: None,
                            seq: r.seq,
                        },
                    )
                })
                .collect();
            for m in memberships.iter().filter(|m| m.table == table) {
                if let Ok(i) = rows.binary_search_by_key(&m.id, |(id, _)| *id) {
                    rows[i].1.membership = Some(m.key.clone());
                }
            }
            tables.push((table, rows));
        }

        let prototypes: Vec<Prototype> = read_json(&source.join(PROTOTYPES_FILE))?;
        Ok(Self { tables, prototypes })
    }
}

fn remove_stale_snapshots(dir: &Path, keep: u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix("snapshot-")) else {
            continue;
        };
        let (seq, staging) = match suffix.strip_suffix(".tmp") {
            Some(s) => (s, true),
            None => (suffix, false),
        };
        let Ok(seq) = seq.parse::<u64>() else {
            continue;
        };
        if (staging || seq != keep)
            && let Err(e) = std::fs::remove_dir_all(entry.path())
        {
            tracing::warn!("[persist] could not remove old snapshot {}: {e}", entry.path().display());
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> EmbedResult<T> {
    let text = std::fs::read_to_string(path).with_path(path)?;
    serde_json::from_str(&text).map_err(|e| EmbedError::InvalidFormat {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> EmbedResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_path(&tmp)?;
    std::fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}
