//! The embedding substrate: store, indexes and prototypes behind one handle.
//!
//! Every mutation goes through here so that validation, the journal record,
//! the prototype side effects and the index drift accounting happen together.
//! Lock order is always record entry, then prototype key(s), then the journal.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Settings;
use crate::error::{EmbedError, EmbedResult, IoContext};
use crate::index::{BuildHandle, IndexMaintainer, IndexState, IndexStatus};
use crate::journal::{Journal, JournalEntry, MemberUpdate, Mutation, RecordRef};
use crate::persistence::{Snapshot, StoreMetadata};
use crate::prototype::{
    CatalogEntry, CoverageLink, Prototype, PrototypeAggregator, PrototypeKey, PrototypeMetadata,
    ROLLUP_KIND, TopicRollup, catalog, coverage_links, plan_topic_rollups,
};
use crate::query::{Neighbor, QueryService, RouteOptions, SearchOptions};
use crate::store::{EmbeddingStore, Row};
use crate::vector::{Embedding, EntityTable, RecordId, VectorContract};

/// Summary returned by [`Substrate::rebuild_topic_rollups`].
#[derive(Debug, Clone, PartialEq)]
pub struct RollupReport {
    pub rollups: Vec<TopicRollup>,
    /// Previous rollup rows whose topic fell out of the ranking.
    pub removed: Vec<PrototypeKey>,
}

/// Result of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    pub seq: u64,
    pub journal_entries_dropped: usize,
}

#[derive(Debug)]
pub struct Substrate {
    settings: Settings,
    contract: VectorContract,
    store: Arc<EmbeddingStore>,
    prototypes: PrototypeAggregator,
    indexes: Arc<IndexMaintainer>,
    journal: Journal,
    data_dir: Option<PathBuf>,
    metadata: Mutex<StoreMetadata>,
}

impl Substrate {
    /// A substrate with no data directory. Nothing survives the process.
    pub fn in_memory(settings: Settings) -> EmbedResult<Self> {
        settings.validate()?;
        let contract = settings.contract()?;
        Ok(Self {
            store: Arc::new(EmbeddingStore::new(contract)),
            prototypes: PrototypeAggregator::new(contract),
            indexes: Arc::new(IndexMaintainer::new(settings.index.clone())?),
            journal: Journal::disabled(0),
            data_dir: None,
            metadata: Mutex::new(StoreMetadata::new(contract.dimension().get())),
            contract,
            settings,
        })
    }

    /// Opens (or initializes) `storage.data_dir`: loads the last snapshot,
    /// replays the journal and rebuilds the recorded indexes.
    pub fn open(settings: Settings) -> EmbedResult<Self> {
        settings.validate()?;
        let contract = settings.contract()?;
        let dir = settings.storage.data_dir.clone();
        std::fs::create_dir_all(&dir).with_path(&dir)?;

        let metadata = if StoreMetadata::exists(&dir) {
            StoreMetadata::load(&dir)?
        } else {
            let metadata = StoreMetadata::new(contract.dimension().get());
            metadata.save(&dir)?;
            tracing::info!("[substrate] initialized data directory {}", dir.display());
            metadata
        };

        let snapshot = Snapshot::read(&dir, &contract, &metadata)?;
        let store = EmbeddingStore::new(contract);
        for (table, rows) in snapshot.tables {
            for (id, row) in rows {
                store.restore_row(table, id, row);
            }
        }
        let prototypes = PrototypeAggregator::from_rows(contract, snapshot.prototypes);

        let (journal, entries) = Journal::open(&dir, metadata.checkpoint_seq)?;
        let journal = if settings.storage.journal {
            journal
        } else {
            Journal::disabled(journal.last_seq())
        };

        let substrate = Self {
            indexes: Arc::new(IndexMaintainer::new(settings.index.clone())?),
            store: Arc::new(store),
            prototypes,
            journal,
            data_dir: Some(dir),
            metadata: Mutex::new(metadata),
            contract,
            settings,
        };
        substrate.replay(entries)?;

        if substrate.settings.index.rebuild_on_open {
            let descriptors = substrate.metadata.lock().indexes.clone();
            for descriptor in descriptors {
                let lists = descriptor.pinned.then_some(descriptor.lists);
                if let Err(e) = substrate.rebuild_index(descriptor.table, lists) {
                    tracing::warn!("[substrate] could not rebuild {} on open: {e}", descriptor.table);
                }
            }
        }

        Ok(substrate)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn contract(&self) -> &VectorContract {
        &self.contract
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn prototypes(&self) -> &PrototypeAggregator {
        &self.prototypes
    }

    pub fn indexes(&self) -> &IndexMaintainer {
        &self.indexes
    }

    pub fn query(&self) -> QueryService<'_> {
        QueryService::new(&self.store, &self.indexes, &self.prototypes)
    }

    pub fn last_seq(&self) -> u64 {
        self.journal.last_seq()
    }

    // ---------------------------------------------------------------------
    // Embedding store
    // ---------------------------------------------------------------------

    /// Creates or replaces a record together with its embedding.
    pub fn upsert_record(
        &self,
        table: EntityTable,
        id: RecordId,
        vector: Option<Vec<f32>>,
    ) -> EmbedResult<()> {
        let embedding = self.store.validate(vector)?;
        self.store.with_row_or_insert(table, id, |row, _| {
            self.write_row(table, id, row, embedding, |vector, member, clear_membership| {
                Mutation::Upsert {
                    table,
                    id,
                    vector,
                    member,
                    clear_membership,
                }
            })
        })?;
        self.indexes.note_write(table, id);
        Ok(())
    }

    /// Replaces the embedding of an existing record. `None` marks the record
    /// as not yet encoded and drops its prototype membership.
    pub fn set_embedding(
        &self,
        table: EntityTable,
        id: RecordId,
        vector: Option<Vec<f32>>,
    ) -> EmbedResult<()> {
        let embedding = self.store.validate(vector)?;
        self.store.with_row(table, id, |row| {
            self.write_row(table, id, row, embedding, |vector, member, clear_membership| {
                Mutation::SetEmbedding {
                    table,
                    id,
                    vector,
                    member,
                    clear_membership,
                }
            })
        })?;
        self.indexes.note_write(table, id);
        Ok(())
    }

    pub fn get_embedding(&self, table: EntityTable, id: RecordId) -> EmbedResult<Option<Embedding>> {
        self.store.get_embedding(table, id)
    }

    /// Deletes a record and its prototype membership.
    pub fn remove_record(&self, table: EntityTable, id: RecordId) -> EmbedResult<()> {
        self.store.remove_with(table, id, |row| {
            let member = match (row.membership(), row.embedding()) {
                (Some(key), Some(old)) => Some((key, old)),
                _ => None,
            };
            if let Some((key, old)) = member {
                let mutation = Mutation::Remove {
                    table,
                    id,
                    member: Some(MemberUpdate {
                        key: key.clone(),
                        old: old.as_slice().to_vec(),
                        new: None,
                    }),
                };
                match self
                    .prototypes
                    .unassign_stamped(key, old, || self.journal.append(&mutation))
                {
                    Ok(()) => return Ok(()),
                    Err(e) if is_drift(&e) => {
                        tracing::debug!("[substrate] dropping stale membership of {table}/{id}: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
            self.journal.append(&Mutation::Remove {
                table,
                id,
                member: None,
            })?;
            Ok(())
        })?;
        self.indexes.note_write(table, id);
        tracing::debug!("[substrate] removed {table}/{id}");
        Ok(())
    }

    /// Applies a new embedding to a locked row, keeping the record's
    /// prototype in step.
    fn write_row(
        &self,
        table: EntityTable,
        id: RecordId,
        row: &mut Row,
        embedding: Option<Embedding>,
        mutation: impl Fn(Option<Vec<f32>>, Option<MemberUpdate>, bool) -> Mutation,
    ) -> EmbedResult<()> {
        let raw = embedding.as_ref().map(|e| e.as_slice().to_vec());
        let seq = Cell::new(0);

        let mut member_applied = false;
        let had_membership = row.membership.is_some();
        if let (Some(key), Some(old)) = (row.membership.clone(), row.embedding.as_ref()) {
            let update = MemberUpdate {
                key: key.clone(),
                old: old.as_slice().to_vec(),
                new: raw.clone(),
            };
            let record = mutation(raw.clone(), Some(update), false);
            let stamp = || {
                let s = self.journal.append(&record)?;
                seq.set(s);
                Ok(s)
            };
            let result = match &embedding {
                Some(new) => self.prototypes.refresh_stamped(&key, old, new, stamp),
                None => self.prototypes.unassign_stamped(&key, old, stamp),
            };
            match result {
                Ok(()) => member_applied = true,
                Err(e) if is_drift(&e) => {
                    tracing::debug!("[substrate] dropping stale membership of {table}/{id}: {e}");
                    row.membership = None;
                }
                Err(e) => return Err(e),
            }
        }

        if !member_applied {
            let cleared = row.membership.is_none() && had_membership;
            seq.set(self.journal.append(&mutation(raw, None, cleared))?);
        }

        if embedding.is_none() {
            row.membership = None;
        }
        row.embedding = embedding;
        row.seq = seq.get();
        tracing::debug!("[substrate] wrote {table}/{id} at seq {}", seq.get());
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Prototypes
    // ---------------------------------------------------------------------

    /// Adds `vector` to the prototype `key`, creating it if needed.
    pub fn assign(&self, key: &PrototypeKey, vector: &[f32]) -> EmbedResult<()> {
        let embedding = self.contract.embedding(vector.to_vec())?;
        let mutation = Mutation::Assign {
            key: key.clone(),
            vector: vector.to_vec(),
            record: None,
        };
        self.prototypes
            .assign_stamped(key, &embedding, || self.journal.append(&mutation))
    }

    pub fn unassign(&self, key: &PrototypeKey, vector: &[f32]) -> EmbedResult<()> {
        let embedding = self.contract.embedding(vector.to_vec())?;
        let mutation = Mutation::Unassign {
            key: key.clone(),
            vector: vector.to_vec(),
            record: None,
        };
        self.prototypes
            .unassign_stamped(key, &embedding, || self.journal.append(&mutation))
    }

    /// Moves `vector` from `from` to `to` in one step, durable as a single
    /// journal entry.
    pub fn reassign(&self, vector: &[f32], from: &PrototypeKey, to: &PrototypeKey) -> EmbedResult<()> {
        let embedding = self.contract.embedding(vector.to_vec())?;
        let mutation = Mutation::Reassign {
            from: from.clone(),
            to: to.clone(),
            vector: vector.to_vec(),
            record: None,
        };
        self.prototypes
            .reassign_stamped(&embedding, from, to, || self.journal.append(&mutation))
    }

    /// Makes a stored record a member of `key`, moving it out of its current
    /// prototype if it has one.
    pub fn assign_record(&self, table: EntityTable, id: RecordId, key: &PrototypeKey) -> EmbedResult<()> {
        self.store.with_row(table, id, |row| {
            let vector = row
                .embedding
                .clone()
                .ok_or(EmbedError::MissingEmbedding { table, id })?;
            let record = Some(RecordRef { table, id });
            let seq = Cell::new(0);

            match row.membership.clone() {
                Some(current) if &current == key => return Ok(()),
                Some(current) => {
                    let mutation = Mutation::Reassign {
                        from: current.clone(),
                        to: key.clone(),
                        vector: vector.as_slice().to_vec(),
                        record,
                    };
                    self.prototypes.reassign_stamped(&vector, &current, key, || {
                        let s = self.journal.append(&mutation)?;
                        seq.set(s);
                        Ok(s)
                    })?;
                }
                None => {
                    let mutation = Mutation::Assign {
                        key: key.clone(),
                        vector: vector.as_slice().to_vec(),
                        record,
                    };
                    self.prototypes.assign_stamped(key, &vector, || {
                        let s = self.journal.append(&mutation)?;
                        seq.set(s);
                        Ok(s)
                    })?;
                }
            }

            row.membership = Some(key.clone());
            row.seq = seq.get();
            Ok(())
        })
    }

    /// Removes a record from its prototype.
    pub fn unassign_record(&self, table: EntityTable, id: RecordId) -> EmbedResult<()> {
        self.store.with_row(table, id, |row| {
            let (Some(key), Some(vector)) = (row.membership.clone(), row.embedding.clone()) else {
                return Err(EmbedError::NotAMember { table, id });
            };
            let mutation = Mutation::Unassign {
                key: key.clone(),
                vector: vector.as_slice().to_vec(),
                record: Some(RecordRef { table, id }),
            };
            let seq = Cell::new(0);
            self.prototypes.unassign_stamped(&key, &vector, || {
                let s = self.journal.append(&mutation)?;
                seq.set(s);
                Ok(s)
            })?;
            row.membership = None;
            row.seq = seq.get();
            Ok(())
        })
    }

    /// Moves a record from its current prototype to `to` atomically.
    pub fn reassign_record(&self, table: EntityTable, id: RecordId, to: &PrototypeKey) -> EmbedResult<()> {
        self.store.with_row(table, id, |row| {
            let (Some(from), Some(vector)) = (row.membership.clone(), row.embedding.clone()) else {
                return Err(EmbedError::NotAMember { table, id });
            };
            let mutation = Mutation::Reassign {
                from: from.clone(),
                to: to.clone(),
                vector: vector.as_slice().to_vec(),
                record: Some(RecordRef { table, id }),
            };
            let seq = Cell::new(0);
            self.prototypes.reassign_stamped(&vector, &from, to, || {
                let s = self.journal.append(&mutation)?;
                seq.set(s);
                Ok(s)
            })?;
            row.membership = Some(to.clone());
            row.seq = seq.get();
            Ok(())
        })
    }

    /// Creates an empty prototype, or updates the topic, document and
    /// metadata of an existing one.
    pub fn register_prototype(
        &self,
        key: &PrototypeKey,
        topic: Option<String>,
        document: Option<String>,
        metadata: PrototypeMetadata,
    ) -> EmbedResult<()> {
        let mutation = Mutation::Register {
            key: key.clone(),
            topic: topic.clone(),
            document: document.clone(),
            metadata: metadata.clone(),
        };
        self.prototypes
            .register_stamped(key, topic, document, metadata, || self.journal.append(&mutation))
    }

    /// Administrative delete. Records that pointed at the prototype lose
    /// their membership.
    pub fn delete_prototype(&self, key: &PrototypeKey) -> EmbedResult<Prototype> {
        let mutation = Mutation::DeletePrototype { key: key.clone() };
        let seq = Cell::new(0);
        let removed = self.prototypes.delete_stamped(key, || {
            let s = self.journal.append(&mutation)?;
            seq.set(s);
            Ok(s)
        })?;
        let dropped = self.store.drop_memberships(key, seq.get());
        tracing::info!("[substrate] deleted prototype '{key}', {dropped} memberships dropped");
        Ok(removed)
    }

    pub fn prototype(&self, key: &PrototypeKey) -> Option<Prototype> {
        self.prototypes.get(key)
    }

    pub fn member_counts(&self, keys: &[PrototypeKey]) -> Vec<Option<u64>> {
        self.prototypes.member_counts(keys)
    }

    /// Recomputes the global `topic:{topic}` prototypes from the
    /// per-document ones. `None` uses `prototypes.rollup_topic_limit`.
    pub fn rebuild_topic_rollups(&self, limit: Option<usize>) -> EmbedResult<RollupReport> {
        let limit = limit.unwrap_or(self.settings.prototypes.rollup_topic_limit);
        let rows = self.prototypes.snapshot();
        let rollups = plan_topic_rollups(&rows, limit);

        for rollup in &rollups {
            let metadata = rollup.metadata();
            let mutation = Mutation::Overwrite {
                key: rollup.key.clone(),
                mean: rollup.mean.clone(),
                member_count: rollup.documents,
                metadata: metadata.clone(),
            };
            self.prototypes.overwrite_stamped(
                &rollup.key,
                rollup.mean.clone(),
                rollup.documents,
                metadata,
                || self.journal.append(&mutation),
            )?;
        }

        let fresh: BTreeSet<&PrototypeKey> = rollups.iter().map(|r| &r.key).collect();
        let mut removed = Vec::new();
        for row in &rows {
            let is_rollup = row.metadata().get("kind").and_then(|v| v.as_str()) == Some(ROLLUP_KIND);
            if is_rollup && !fresh.contains(row.key()) {
                match self.delete_prototype(row.key()) {
                    Ok(_) => removed.push(row.key().clone()),
                    Err(EmbedError::PrototypeNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            "[substrate] rebuilt {} topic rollups, removed {}",
            rollups.len(),
            removed.len()
        );
        Ok(RollupReport { rollups, removed })
    }

    /// Global topic prototypes, largest first.
    pub fn catalog(&self, limit: usize) -> Vec<CatalogEntry> {
        catalog(&self.prototypes.snapshot(), limit)
    }

    /// Links the top `topic_limit` catalog topics to the documents whose
    /// embeddings are similar to the topic centroid.
    pub fn coverage_links(&self, topic_limit: usize, min_similarity: Option<f32>) -> Vec<CoverageLink> {
        let min_similarity =
            min_similarity.unwrap_or(self.settings.prototypes.coverage_min_similarity);
        let topics: Vec<(PrototypeKey, Vec<f32>)> = self
            .catalog(topic_limit)
            .into_iter()
            .filter_map(|entry| {
                let centroid = self.prototypes.get(&entry.key)?.centroid()?;
                Some((entry.key, centroid.into_inner()))
            })
            .collect();
        let documents = self.store.embeddings(EntityTable::Documents);
        coverage_links(
            &topics,
            documents.iter().map(|(id, e)| (*id, e.as_slice())),
            min_similarity,
        )
    }

    // ---------------------------------------------------------------------
    // Queries and indexes
    // ---------------------------------------------------------------------

    pub fn search(
        &self,
        table: EntityTable,
        query: &[f32],
        k: usize,
        options: SearchOptions,
    ) -> EmbedResult<Vec<Neighbor>> {
        self.query().search(table, query, k, options)
    }

    /// Routed search; `None` consults `prototypes.route_top_n` prototypes.
    pub fn route_then_search(
        &self,
        table: EntityTable,
        query: &[f32],
        k: usize,
        prototypes: Option<usize>,
        exact: bool,
    ) -> EmbedResult<Vec<Neighbor>> {
        let options = RouteOptions {
            prototypes: prototypes.unwrap_or(self.settings.prototypes.route_top_n),
            exact,
        };
        self.query().route_then_search(table, query, k, options)
    }

    pub fn rebuild_index(&self, table: EntityTable, lists: Option<usize>) -> EmbedResult<IndexStatus> {
        self.indexes.rebuild_index(&self.store, table, lists)
    }

    pub fn spawn_rebuild(&self, table: EntityTable, lists: Option<usize>) -> EmbedResult<BuildHandle> {
        self.indexes
            .spawn_rebuild(Arc::clone(&self.store), table, lists)
    }

    pub fn run_maintenance(&self) -> Vec<(EntityTable, EmbedResult<IndexStatus>)> {
        self.indexes.run_maintenance(&self.store)
    }

    pub fn index_status(&self, table: EntityTable) -> IndexStatus {
        self.indexes.status(table)
    }

    pub fn index_state(&self, table: EntityTable) -> IndexState {
        self.indexes.state(table)
    }

    // ---------------------------------------------------------------------
    // Durability
    // ---------------------------------------------------------------------

    /// Writes a snapshot of everything up to the current journal sequence
    /// and compacts the journal.
    pub fn checkpoint(&self) -> EmbedResult<CheckpointReport> {
        let Some(dir) = self.data_dir.as_deref() else {
            return Err(EmbedError::Config {
                reason: "an in-memory substrate has no data directory to checkpoint".to_string(),
            });
        };

        // Serializes checkpoints.
        let mut metadata = self.metadata.lock();
        let seq = self.journal.last_seq();
        self.journal.sync()?;

        let mut snapshot = Snapshot::capture_rows(&self.store);
        snapshot.prototypes = self.prototypes.snapshot();
        metadata.indexes = self.indexes.descriptors();
        snapshot.write(dir, &self.contract, &mut metadata, seq)?;

        let dropped = self.journal.compact(seq)?;
        Ok(CheckpointReport {
            seq,
            journal_entries_dropped: dropped,
        })
    }

    /// Applies journal entries newer than the loaded snapshot.
    fn replay(&self, entries: Vec<JournalEntry>) -> EmbedResult<()> {
        let checkpoint = self.metadata.lock().checkpoint_seq;
        let mut applied = 0usize;
        let mut skipped = 0usize;

        for entry in entries.into_iter().filter(|e| e.seq > checkpoint) {
            if self.apply_replayed(entry)? {
                applied += 1;
            } else {
                skipped += 1;
            }
        }

        let dangling = self
            .store
            .drop_dangling_memberships(|key| self.prototypes.get(key).is_some());
        if dangling > 0 {
            tracing::warn!("[substrate] dropped {dangling} memberships to missing prototypes");
        }
        if applied + skipped > 0 {
            tracing::info!(
                "[substrate] journal replay: {applied} entries applied, {skipped} already reflected"
            );
        }
        Ok(())
    }

    fn apply_replayed(&self, entry: JournalEntry) -> EmbedResult<bool> {
        let seq = entry.seq;
        let validate = |v: &[f32]| -> EmbedResult<()> {
            self.contract.validate(v)?;
            Ok(())
        };

        let applied = match entry.mutation {
            Mutation::Upsert {
                table,
                id,
                vector,
                member,
                clear_membership,
            }
            | Mutation::SetEmbedding {
                table,
                id,
                vector,
                member,
                clear_membership,
            } => {
                let embedding = self.store.validate(vector)?;
                let drops_membership = clear_membership
                    || embedding.is_none()
                    || member.as_ref().is_some_and(|m| m.new.is_none());
                let row = self.store.replay_row(table, id, seq, true, |row| {
                    row.embedding = embedding;
                    if drops_membership {
                        row.membership = None;
                    }
                });
                let proto = member.is_some_and(|m| self.replay_member(&m, seq));
                row || proto
            }
            Mutation::Remove { table, id, member } => {
                let row = self.store.replay_remove(table, id, seq);
                let proto = member.is_some_and(|m| self.replay_member(&m, seq));
                row || proto
            }
            Mutation::Assign { key, vector, record } => {
                validate(&vector)?;
                let proto = self
                    .prototypes
                    .apply_replayed(&key, seq, true, |p| p.add_member(&vector));
                let row = record.is_some_and(|r| {
                    self.store.replay_row(r.table, r.id, seq, false, |row| {
                        row.membership = Some(key.clone());
                    })
                });
                proto || row
            }
            Mutation::Unassign { key, vector, record } => {
                validate(&vector)?;
                let proto = self
                    .prototypes
                    .apply_replayed(&key, seq, false, |p| remove_if_counted(p, &vector));
                let row = record.is_some_and(|r| {
                    self.store.replay_row(r.table, r.id, seq, false, |row| {
                        row.membership = None;
                    })
                });
                proto || row
            }
            Mutation::Reassign {
                from,
                to,
                vector,
                record,
            } => {
                validate(&vector)?;
                let out = if from == to {
                    false
                } else {
                    self.prototypes
                        .apply_replayed(&from, seq, false, |p| remove_if_counted(p, &vector))
                };
                let into = from != to
                    && self
                        .prototypes
                        .apply_replayed(&to, seq, true, |p| p.add_member(&vector));
                let row = record.is_some_and(|r| {
                    self.store.replay_row(r.table, r.id, seq, false, |row| {
                        row.membership = Some(to.clone());
                    })
                });
                out || into || row
            }
            Mutation::Register {
                key,
                topic,
                document,
                metadata,
            } => self
                .prototypes
                .apply_replayed(&key, seq, true, |p| p.describe(topic, document, metadata)),
            Mutation::Overwrite {
                key,
                mean,
                member_count,
                metadata,
            } => self.prototypes.apply_replayed(&key, seq, true, |p| {
                p.overwrite(mean, member_count);
                p.describe(None, None, metadata);
            }),
            Mutation::DeletePrototype { key } => {
                let proto = self.prototypes.delete_replayed(&key, seq);
                let rows = self.store.drop_memberships(&key, seq);
                proto || rows > 0
            }
        };
        Ok(applied)
    }

    fn replay_member(&self, member: &MemberUpdate, seq: u64) -> bool {
        self.prototypes.apply_replayed(&member.key, seq, false, |p| {
            remove_if_counted(p, &member.old);
            if let Some(new) = &member.new {
                p.add_member(new);
            }
        })
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        self.indexes.cancel_all();
    }
}

fn remove_if_counted(prototype: &mut Prototype, vector: &[f32]) {
    if prototype.ensure_removable().is_ok() {
        prototype.remove_member(vector);
    }
}

/// Errors that mean a membership points at a prototype that no longer
/// counts the record, typically after an administrative delete.
fn is_drift(error: &EmbedError) -> bool {
    matches!(
        error,
        EmbedError::PrototypeNotFound { .. } | EmbedError::EmptyPrototype { .. }
    )
}
