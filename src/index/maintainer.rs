//! Index lifecycle per embedding column.
//!
//! ```text
//! Absent -> Building -> Ready -> Stale -> Building -> Ready ...
//! ```
//!
//! A build trains on a copy of the column taken when it starts. Rows written
//! after that point stay in the changed set once the new index is installed,
//! so approximate queries keep seeing them. Readers always get the serving
//! index as an `Arc`; installing a new one never blocks a running query.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::IndexConfig;
use crate::error::{EmbedError, EmbedResult};
use crate::index::IvfIndex;
use crate::store::EmbeddingStore;
use crate::vector::{ClusteringError, DistanceMetric, EntityTable, RecordId};

/// Freshness of one column's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Absent,
    Building,
    Ready,
    Stale,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one column's index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub table: EntityTable,
    pub column: &'static str,
    pub state: IndexState,
    pub lists: Option<usize>,
    pub rows_indexed: usize,
    pub rows_changed: usize,
    pub built_at: Option<DateTime<Utc>>,
}

/// Persisted description of an index, enough to rebuild it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub table: EntityTable,
    pub column: String,
    pub metric: DistanceMetric,
    pub lists: usize,
    /// Whether `lists` was requested explicitly and should be reused.
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug)]
struct Slot {
    state: IndexState,
    serving: Option<Arc<IvfIndex>>,
    /// Rows changed since the serving index's snapshot, with the write epoch
    /// of their latest change.
    changed: HashMap<RecordId, u64>,
    epoch: u64,
    generation: u64,
    building: Option<CancellationToken>,
    pinned_lists: Option<usize>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: IndexState::Absent,
            serving: None,
            changed: HashMap::new(),
            epoch: 0,
            generation: 0,
            building: None,
            pinned_lists: None,
        }
    }

    /// State implied by the serving index and the changed set, ignoring any
    /// build in flight.
    fn settled_state(&self, drift_threshold: usize) -> IndexState {
        match self.serving {
            None => IndexState::Absent,
            Some(_) if self.changed.len() > drift_threshold => IndexState::Stale,
            Some(_) => IndexState::Ready,
        }
    }

    fn tracks_changes(&self) -> bool {
        self.serving.is_some() || self.building.is_some()
    }
}

/// Issued when a build starts; identifies it when it finishes.
#[derive(Debug, Clone)]
struct BuildTicket {
    table: EntityTable,
    generation: u64,
    epoch: u64,
    token: CancellationToken,
}

/// Settles the slot when a build unwinds before reaching `finish`, so a
/// panicked build never leaves the index marked as building.
struct SettleOnUnwind<'a> {
    maintainer: &'a IndexMaintainer,
    ticket: &'a BuildTicket,
}

impl Drop for SettleOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::warn!("[index] build of {} panicked", self.ticket.table);
            self.maintainer.finish(self.ticket, None);
        }
    }
}

/// A build running on its own thread.
#[derive(Debug)]
pub struct BuildHandle {
    table: EntityTable,
    token: CancellationToken,
    thread: JoinHandle<EmbedResult<IndexStatus>>,
}

impl BuildHandle {
    pub fn table(&self) -> EntityTable {
        self.table
    }

    /// Requests cancellation; the serving index is left untouched.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the build to finish.
    pub fn wait(self) -> EmbedResult<IndexStatus> {
        self.thread.join().unwrap_or_else(|_| {
            Err(EmbedError::BuildFailed {
                table: self.table,
                reason: "build thread panicked".to_string(),
            })
        })
    }
}

/// Owns the IVF index of every embedding column and their lifecycle.
#[derive(Debug)]
pub struct IndexMaintainer {
    config: IndexConfig,
    slots: [Mutex<Slot>; 5],
    pool: rayon::ThreadPool,
}

impl IndexMaintainer {
    pub fn new(config: IndexConfig) -> EmbedResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.build_threads.max(1))
            .thread_name(|i| format!("index-build-{i}"))
            .build()
            .map_err(|e| EmbedError::Config {
                reason: format!("cannot start index build threads: {e}"),
            })?;
        Ok(Self {
            config,
            slots: std::array::from_fn(|_| Mutex::new(Slot::new())),
            pool,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn slot(&self, table: EntityTable) -> &Mutex<Slot> {
        &self.slots[table.ordinal()]
    }

    pub fn state(&self, table: EntityTable) -> IndexState {
        self.slot(table).lock().state
    }

    /// Index currently answering approximate queries, with the rows changed
    /// since it was built.
    pub fn serving(&self, table: EntityTable) -> Option<(Arc<IvfIndex>, Vec<RecordId>)> {
        let slot = self.slot(table).lock();
        let index = slot.serving.as_ref()?;
        Some((Arc::clone(index), slot.changed.keys().copied().collect()))
    }

    /// Records that `id` changed. Called for every store write.
    pub fn note_write(&self, table: EntityTable, id: RecordId) {
        let mut slot = self.slot(table).lock();
        if !slot.tracks_changes() {
            return;
        }
        slot.epoch += 1;
        let epoch = slot.epoch;
        slot.changed.insert(id, epoch);

        if slot.state == IndexState::Ready && slot.changed.len() > self.config.drift_threshold {
            slot.state = IndexState::Stale;
            tracing::info!(
                "[index] {table}.{} is stale: {} rows changed since last build",
                table.column(),
                slot.changed.len()
            );
        }
    }

    pub fn status(&self, table: EntityTable) -> IndexStatus {
        let slot = self.slot(table).lock();
        IndexStatus {
            table,
            column: table.column(),
            state: slot.state,
            lists: slot.serving.as_ref().map(|i| i.lists()),
            rows_indexed: slot.serving.as_ref().map_or(0, |i| i.rows()),
            rows_changed: slot.changed.len(),
            built_at: slot.serving.as_ref().map(|i| i.built_at()),
        }
    }

    /// Descriptors of every serving index.
    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        EntityTable::ALL
            .into_iter()
            .filter_map(|table| {
                let slot = self.slot(table).lock();
                slot.serving.as_ref().map(|index| IndexDescriptor {
                    table,
                    column: table.column().to_string(),
                    metric: DistanceMetric::L2,
                    lists: index.lists(),
                    pinned: slot.pinned_lists.is_some(),
                })
            })
            .collect()
    }

    /// Builds the index synchronously on the build pool.
    pub fn rebuild_index(
        &self,
        store: &EmbeddingStore,
        table: EntityTable,
        lists: Option<usize>,
    ) -> EmbedResult<IndexStatus> {
        let ticket = self.begin(table);
        self.run(&ticket, store, lists)
    }

    /// Starts a build on a background thread. Any build already running for
    /// the table is cancelled first.
    pub fn spawn_rebuild(
        self: &Arc<Self>,
        store: Arc<EmbeddingStore>,
        table: EntityTable,
        lists: Option<usize>,
    ) -> EmbedResult<BuildHandle> {
        let ticket = self.begin(table);
        let fallback = ticket.clone();
        let maintainer = Arc::clone(self);

        let spawned = std::thread::Builder::new()
            .name(format!("rebuild-{table}"))
            .spawn(move || maintainer.run(&ticket, &store, lists));

        match spawned {
            Ok(thread) => Ok(BuildHandle {
                table,
                token: fallback.token,
                thread,
            }),
            Err(e) => {
                fallback.token.cancel();
                self.finish(&fallback, None);
                Err(EmbedError::BuildFailed {
                    table,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Rebuilds every stale index when auto rebuild is enabled. Failures are
    /// logged and leave the index serving as it was.
    pub fn run_maintenance(
        &self,
        store: &EmbeddingStore,
    ) -> Vec<(EntityTable, EmbedResult<IndexStatus>)> {
        if !self.config.auto_rebuild {
            return Vec::new();
        }
        EntityTable::ALL
            .into_iter()
            .filter(|&table| self.state(table) == IndexState::Stale)
            .map(|table| {
                let lists = self.slot(table).lock().pinned_lists;
                let result = self.rebuild_index(store, table, lists);
                if let Err(e) = &result {
                    tracing::warn!("[index] scheduled rebuild of {table} failed: {e}");
                }
                (table, result)
            })
            .collect()
    }

    /// Cancels every build in flight.
    pub fn cancel_all(&self) {
        for slot in &self.slots {
            if let Some(token) = &slot.lock().building {
                token.cancel();
            }
        }
    }

    fn begin(&self, table: EntityTable) -> BuildTicket {
        let mut slot = self.slot(table).lock();
        if let Some(previous) = slot.building.take() {
            previous.cancel();
            tracing::debug!("[index] superseded in-flight build of {table}");
        }
        slot.generation += 1;
        let token = CancellationToken::new();
        slot.building = Some(token.clone());
        slot.state = IndexState::Building;
        tracing::info!("[index] building {table}.{}", table.column());
        BuildTicket {
            table,
            generation: slot.generation,
            epoch: slot.epoch,
            token,
        }
    }

    fn run(
        &self,
        ticket: &BuildTicket,
        store: &EmbeddingStore,
        lists: Option<usize>,
    ) -> EmbedResult<IndexStatus> {
        let _settle = SettleOnUnwind {
            maintainer: self,
            ticket,
        };
        let table = ticket.table;
        let rows = store.embeddings(table);
        let target = lists.unwrap_or_else(|| self.config.lists_for_rows(rows.len()));

        if rows.is_empty() || target == 0 || rows.len() < target {
            self.finish(ticket, None);
            let err = EmbedError::InsufficientData {
                table,
                rows: rows.len(),
                lists: target,
            };
            tracing::warn!("[index] {err}");
            return Err(err);
        }

        let trained = self.pool.install(|| {
            IvfIndex::train(
                table,
                &rows,
                target,
                self.config.max_iterations,
                self.config.seed,
                &ticket.token,
            )
        });

        match trained {
            Ok(index) => {
                if self.finish(ticket, Some((index, lists))) {
                    Ok(self.status(table))
                } else {
                    Err(EmbedError::BuildCancelled { table })
                }
            }
            Err(ClusteringError::Cancelled(_)) => {
                self.finish(ticket, None);
                tracing::info!("[index] build of {table} cancelled");
                Err(EmbedError::BuildCancelled { table })
            }
            Err(e) => {
                self.finish(ticket, None);
                tracing::warn!("[index] build of {table} failed: {e}");
                Err(EmbedError::BuildFailed {
                    table,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Installs `built` if this build is still the current one. Returns
    /// whether the index was installed. Superseded builds change nothing.
    fn finish(&self, ticket: &BuildTicket, built: Option<(IvfIndex, Option<usize>)>) -> bool {
        let mut slot = self.slot(ticket.table).lock();
        if slot.generation != ticket.generation {
            return false;
        }
        slot.building = None;

        let installed = match built {
            Some((index, pinned)) if !ticket.token.is_cancelled() => {
                tracing::info!(
                    "[index] {}.{} ready with {} lists over {} rows",
                    ticket.table,
                    ticket.table.column(),
                    index.lists(),
                    index.rows()
                );
                slot.serving = Some(Arc::new(index));
                slot.pinned_lists = pinned;
                slot.changed.retain(|_, epoch| *epoch > ticket.epoch);
                true
            }
            _ => false,
        };
        if slot.serving.is_none() {
            slot.changed.clear();
        }
        slot.state = slot.settled_state(self.config.drift_threshold);
        installed
    }
}
