//! Nearest-neighbor queries over one embedding column.
//!
//! Results are ordered by ascending squared L2 distance, ties broken by
//! ascending record id. The exact path scans every non-null embedding; the
//! approximate path scores the candidates produced by the serving IVF index
//! plus every row changed since that index was built.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use serde::Serialize;

use crate::error::EmbedResult;
use crate::index::IndexMaintainer;
use crate::prototype::{PrototypeAggregator, PrototypeKey};
use crate::store::EmbeddingStore;
use crate::vector::{Embedding, EntityTable, RecordId, squared_l2};

/// One ranked result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: RecordId,
    pub distance: f32,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Scan every row instead of consulting the index.
    pub exact: bool,
}

impl SearchOptions {
    pub fn exact() -> Self {
        Self { exact: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOptions {
    /// Number of nearest prototypes whose members are searched.
    pub prototypes: usize,
    pub exact: bool,
}

/// Keeps the `k` best neighbors seen so far.
struct TopK {
    k: usize,
    heap: BinaryHeap<Neighbor>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn offer(&mut self, id: RecordId, distance: f32) {
        if self.k == 0 {
            return;
        }
        let candidate = Neighbor { id, distance };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    fn into_sorted(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

/// Read-side view over the store, its indexes and the prototypes.
#[derive(Debug, Clone, Copy)]
pub struct QueryService<'a> {
    store: &'a EmbeddingStore,
    indexes: &'a IndexMaintainer,
    prototypes: &'a PrototypeAggregator,
}

impl<'a> QueryService<'a> {
    pub fn new(
        store: &'a EmbeddingStore,
        indexes: &'a IndexMaintainer,
        prototypes: &'a PrototypeAggregator,
    ) -> Self {
        Self {
            store,
            indexes,
            prototypes,
        }
    }

    /// The `k` nearest rows of `table` to `query`.
    pub fn search(
        &self,
        table: EntityTable,
        query: &[f32],
        k: usize,
        options: SearchOptions,
    ) -> EmbedResult<Vec<Neighbor>> {
        self.store.contract().validate(query)?;
        Ok(self.search_within(table, query, k, options.exact, None))
    }

    /// Searches only the members of the `prototypes` prototypes whose
    /// centroids are nearest to `query`. Only prototypes with members in
    /// `table` are ranked, so memberless rows such as topic rollups never
    /// take a slot. When that covers every candidate prototype the
    /// restriction is dropped and this equals [`search`](Self::search).
    pub fn route_then_search(
        &self,
        table: EntityTable,
        query: &[f32],
        k: usize,
        options: RouteOptions,
    ) -> EmbedResult<Vec<Neighbor>> {
        self.store.contract().validate(query)?;

        let with_members = self.store.member_prototypes(table);
        let centroids: Vec<(PrototypeKey, Embedding)> = self
            .prototypes
            .centroids()
            .into_iter()
            .filter(|(key, _)| with_members.contains(key))
            .collect();
        if options.prototypes >= centroids.len() {
            return Ok(self.search_within(table, query, k, options.exact, None));
        }

        let mut ranked: Vec<(f32, &PrototypeKey)> = centroids
            .iter()
            .map(|(key, centroid)| (squared_l2(query, centroid.as_slice()), key))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let routed: HashSet<PrototypeKey> = ranked
            .into_iter()
            .take(options.prototypes)
            .map(|(_, key)| key.clone())
            .collect();
        tracing::debug!(
            "[query] routing {table} search through {} prototypes",
            routed.len()
        );

        let members: HashSet<RecordId> =
            self.store.members_of(table, &routed).into_iter().collect();
        Ok(self.search_within(table, query, k, options.exact, Some(&members)))
    }

    fn search_within(
        &self,
        table: EntityTable,
        query: &[f32],
        k: usize,
        exact: bool,
        allowed: Option<&HashSet<RecordId>>,
    ) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        let mut top = TopK::new(k);
        let admits = |id: RecordId| allowed.is_none_or(|set| set.contains(&id));

        let serving = if exact {
            None
        } else {
            self.indexes.serving(table)
        };

        match (serving, allowed) {
            (Some((index, changed)), _) => {
                let probes = self.indexes.config().probes;
                let mut candidates: HashSet<RecordId> = index
                    .candidates_where(query, probes, k, admits)
                    .into_iter()
                    .collect();
                candidates.extend(changed.into_iter().filter(|&id| admits(id)));
                self.store.for_each_of(table, candidates, |id, v| {
                    top.offer(id, squared_l2(query, v));
                });
            }
            (None, Some(members)) => {
                self.store.for_each_of(table, members.iter().copied(), |id, v| {
                    top.offer(id, squared_l2(query, v));
                });
            }
            (None, None) => {
                self.store.for_each_embedding(table, |id, v| {
                    top.offer(id, squared_l2(query, v));
                });
            }
        }

        top.into_sorted()
    }
}
