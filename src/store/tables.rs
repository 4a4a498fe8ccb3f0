//! The five entity tables and their embedding columns.
//!
//! Each table is a `DashMap` keyed by record id. Holding a row's entry is the
//! per-record write lock: every change to one record happens inside a single
//! entry borrow, so writes to the same record apply in order and writes to
//! different records proceed in parallel.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{EmbedError, EmbedResult};
use crate::prototype::PrototypeKey;
use crate::vector::{Embedding, EntityTable, RecordId, VectorContract};

/// Stored state of one entity record, as far as this crate owns it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub(crate) embedding: Option<Embedding>,
    pub(crate) membership: Option<PrototypeKey>,
    /// Highest journal sequence applied to this row.
    pub(crate) seq: u64,
}

impl Row {
    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }

    pub fn membership(&self) -> Option<&PrototypeKey> {
        self.membership.as_ref()
    }
}

/// Embedding columns for all entity tables, validated by one shared contract.
#[derive(Debug)]
pub struct EmbeddingStore {
    contract: VectorContract,
    tables: [DashMap<RecordId, Row>; 5],
}

impl EmbeddingStore {
    pub fn new(contract: VectorContract) -> Self {
        Self {
            contract,
            tables: std::array::from_fn(|_| DashMap::new()),
        }
    }

    pub fn contract(&self) -> &VectorContract {
        &self.contract
    }

    fn table(&self, table: EntityTable) -> &DashMap<RecordId, Row> {
        &self.tables[table.ordinal()]
    }

    /// Validates a raw vector against the shared contract.
    pub fn validate(&self, vector: Option<Vec<f32>>) -> EmbedResult<Option<Embedding>> {
        vector
            .map(|v| self.contract.embedding(v))
            .transpose()
            .map_err(EmbedError::from)
    }

    /// Current embedding; `Ok(None)` means the record exists but is not
    /// encoded yet.
    pub fn get_embedding(&self, table: EntityTable, id: RecordId) -> EmbedResult<Option<Embedding>> {
        self.table(table)
            .get(&id)
            .map(|row| row.embedding.clone())
            .ok_or(EmbedError::RecordNotFound { table, id })
    }

    pub fn membership(&self, table: EntityTable, id: RecordId) -> EmbedResult<Option<PrototypeKey>> {
        self.table(table)
            .get(&id)
            .map(|row| row.membership.clone())
            .ok_or(EmbedError::RecordNotFound { table, id })
    }

    pub fn contains(&self, table: EntityTable, id: RecordId) -> bool {
        self.table(table).contains_key(&id)
    }

    /// Runs `f` with the record locked. Unknown records fail with
    /// `RecordNotFound` before `f` runs.
    pub(crate) fn with_row<R>(
        &self,
        table: EntityTable,
        id: RecordId,
        f: impl FnOnce(&mut Row) -> EmbedResult<R>,
    ) -> EmbedResult<R> {
        let mut row = self
            .table(table)
            .get_mut(&id)
            .ok_or(EmbedError::RecordNotFound { table, id })?;
        f(row.value_mut())
    }

    /// Runs `f` with the record locked, creating an empty row first if it
    /// does not exist. A row created for an `f` that fails is removed again.
    pub(crate) fn with_row_or_insert<R>(
        &self,
        table: EntityTable,
        id: RecordId,
        f: impl FnOnce(&mut Row, bool) -> EmbedResult<R>,
    ) -> EmbedResult<R> {
        match self.table(table).entry(id) {
            Entry::Occupied(mut occupied) => f(occupied.get_mut(), true),
            Entry::Vacant(vacant) => {
                let mut row = Row::default();
                let result = f(&mut row, false);
                if result.is_ok() {
                    vacant.insert(row);
                }
                result
            }
        }
    }

    /// Runs `f` with the record locked and deletes the row if `f` succeeds.
    pub(crate) fn remove_with<R>(
        &self,
        table: EntityTable,
        id: RecordId,
        f: impl FnOnce(&Row) -> EmbedResult<R>,
    ) -> EmbedResult<R> {
        match self.table(table).entry(id) {
            Entry::Occupied(occupied) => {
                let result = f(occupied.get())?;
                occupied.remove();
                Ok(result)
            }
            Entry::Vacant(_) => Err(EmbedError::RecordNotFound { table, id }),
        }
    }

    /// Number of records, encoded or not.
    pub fn record_count(&self, table: EntityTable) -> usize {
        self.table(table).len()
    }

    /// Number of records with an embedding.
    pub fn embedded_count(&self, table: EntityTable) -> usize {
        self.table(table)
            .iter()
            .filter(|r| r.embedding.is_some())
            .count()
    }

    /// Copies every non-null embedding, ordered by record id.
    pub fn embeddings(&self, table: EntityTable) -> Vec<(RecordId, Embedding)> {
        let mut rows: Vec<(RecordId, Embedding)> = self
            .table(table)
            .iter()
            .filter_map(|r| r.embedding.clone().map(|e| (*r.key(), e)))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    /// Visits every non-null embedding without copying.
    pub fn for_each_embedding(&self, table: EntityTable, mut f: impl FnMut(RecordId, &[f32])) {
        for row in self.table(table).iter() {
            if let Some(embedding) = &row.embedding {
                f(*row.key(), embedding.as_slice());
            }
        }
    }

    /// Visits the embeddings of the given records that are still encoded.
    pub fn for_each_of(
        &self,
        table: EntityTable,
        ids: impl IntoIterator<Item = RecordId>,
        mut f: impl FnMut(RecordId, &[f32]),
    ) {
        let table = self.table(table);
        for id in ids {
            if let Some(row) = table.get(&id)
                && let Some(embedding) = &row.embedding
            {
                f(id, embedding.as_slice());
            }
        }
    }

    /// Records whose prototype membership is one of `keys`.
    pub fn members_of(&self, table: EntityTable, keys: &HashSet<PrototypeKey>) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .table(table)
            .iter()
            .filter(|r| r.membership.as_ref().is_some_and(|k| keys.contains(k)))
            .map(|r| *r.key())
            .collect();
        ids.sort();
        ids
    }

    /// Prototypes with at least one member in `table`.
    pub fn member_prototypes(&self, table: EntityTable) -> HashSet<PrototypeKey> {
        self.table(table)
            .iter()
            .filter_map(|r| r.membership.clone())
            .collect()
    }

    /// Records in any table pointing at `key`.
    pub fn members_anywhere(&self, key: &PrototypeKey) -> Vec<(EntityTable, RecordId)> {
        EntityTable::ALL
            .into_iter()
            .flat_map(|table| {
                self.table(table)
                    .iter()
                    .filter(|r| r.membership.as_ref() == Some(key))
                    .map(move |r| (table, *r.key()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Copy of every row in a table, ordered by record id.
    pub(crate) fn rows(&self, table: EntityTable) -> Vec<(RecordId, Row)> {
        let mut rows: Vec<(RecordId, Row)> = self
            .table(table)
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    /// Inserts a row loaded from a snapshot.
    pub(crate) fn restore_row(&self, table: EntityTable, id: RecordId, row: Row) {
        self.table(table).insert(id, row);
    }

    /// Applies a journal entry to one row unless the row already reflects
    /// `seq`. Missing rows are created when `create` is set, skipped
    /// otherwise.
    pub(crate) fn replay_row(
        &self,
        table: EntityTable,
        id: RecordId,
        seq: u64,
        create: bool,
        f: impl FnOnce(&mut Row),
    ) -> bool {
        let rows = self.table(table);
        let mut row = if create {
            rows.entry(id).or_default()
        } else {
            match rows.get_mut(&id) {
                Some(row) => row,
                None => return false,
            }
        };
        if row.seq >= seq {
            return false;
        }
        f(row.value_mut());
        row.seq = seq;
        true
    }

    /// Journal replay of a record removal.
    pub(crate) fn replay_remove(&self, table: EntityTable, id: RecordId, seq: u64) -> bool {
        self.table(table)
            .remove_if(&id, |_, row| row.seq < seq)
            .is_some()
    }

    /// Drops memberships pointing at `key` that predate `before_seq`.
    pub(crate) fn drop_memberships(&self, key: &PrototypeKey, before_seq: u64) -> usize {
        let mut dropped = 0;
        for (table, id) in self.members_anywhere(key) {
            if let Some(mut row) = self.table(table).get_mut(&id)
                && row.membership.as_ref() == Some(key)
                && row.seq < before_seq
            {
                row.membership = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Drops memberships whose prototype fails `exists`.
    pub(crate) fn drop_dangling_memberships(&self, exists: impl Fn(&PrototypeKey) -> bool) -> usize {
        let mut dropped = 0;
        for rows in &self.tables {
            for mut row in rows.iter_mut() {
                if row.membership.as_ref().is_some_and(|k| !exists(k)) {
                    row.membership = None;
                    dropped += 1;
                }
            }
        }
        dropped
    }
}
