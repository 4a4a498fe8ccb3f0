//! The prototypes table with per-key locking.
//!
//! Each key owns its own mutex; operations on different keys never contend.
//! Two-key operations (reassignment, consistent reads) lock in ascending key
//! order so they cannot deadlock against each other.
//!
//! Mutating operations take a `stamp` closure that runs under the key locks
//! after validation and before the change is applied. The substrate uses it
//! to append the journal record; the returned sequence is written into the
//! touched rows so replay can skip work that already happened.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{EmbedError, EmbedResult};
use crate::prototype::{Prototype, PrototypeKey, PrototypeMetadata};
use crate::vector::{Embedding, VectorContract};

#[derive(Debug)]
struct Slot {
    prototype: Prototype,
    deleted: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Maintains one incrementally updated centroid per prototype key.
#[derive(Debug)]
pub struct PrototypeAggregator {
    contract: VectorContract,
    slots: DashMap<PrototypeKey, SlotRef>,
}

impl PrototypeAggregator {
    pub fn new(contract: VectorContract) -> Self {
        Self {
            contract,
            slots: DashMap::new(),
        }
    }

    /// Restores rows loaded from a snapshot.
    pub fn from_rows(contract: VectorContract, rows: Vec<Prototype>) -> Self {
        let aggregator = Self::new(contract);
        for row in rows {
            aggregator.slots.insert(
                row.key().clone(),
                Arc::new(Mutex::new(Slot {
                    prototype: row,
                    deleted: false,
                })),
            );
        }
        aggregator
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Adds `vector` to the prototype, creating the row with one member if
    /// it does not exist yet.
    pub fn assign(&self, key: &PrototypeKey, vector: &Embedding) -> EmbedResult<()> {
        self.assign_stamped(key, vector, || Ok(0))
    }

    /// Removes `vector` from the prototype. The row is kept at count zero.
    pub fn unassign(&self, key: &PrototypeKey, vector: &Embedding) -> EmbedResult<()> {
        self.unassign_stamped(key, vector, || Ok(0))
    }

    /// Moves one member from `from` to `to` as a single step.
    pub fn reassign(
        &self,
        vector: &Embedding,
        from: &PrototypeKey,
        to: &PrototypeKey,
    ) -> EmbedResult<()> {
        self.reassign_stamped(vector, from, to, || Ok(0))
    }

    pub(crate) fn assign_stamped(
        &self,
        key: &PrototypeKey,
        vector: &Embedding,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<()> {
        self.ensure_contract(vector)?;
        self.with_slot(key, true, |proto| {
            let seq = stamp()?;
            proto.add_member(vector.as_slice());
            proto.stamp(seq);
            Ok(())
        })?;
        tracing::debug!("[prototype] assigned member to prototype '{key}'");
        Ok(())
    }

    pub(crate) fn unassign_stamped(
        &self,
        key: &PrototypeKey,
        vector: &Embedding,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<()> {
        self.ensure_contract(vector)?;
        self.with_slot(key, false, |proto| {
            proto.ensure_removable()?;
            let seq = stamp()?;
            proto.remove_member(vector.as_slice());
            proto.stamp(seq);
            Ok(())
        })?;
        tracing::debug!("[prototype] removed member from prototype '{key}'");
        Ok(())
    }

    /// Replaces one member's vector inside the same prototype.
    pub(crate) fn refresh_stamped(
        &self,
        key: &PrototypeKey,
        old: &Embedding,
        new: &Embedding,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<()> {
        self.ensure_contract(old)?;
        self.ensure_contract(new)?;
        self.with_slot(key, false, |proto| {
            proto.ensure_removable()?;
            let seq = stamp()?;
            proto.remove_member(old.as_slice());
            proto.add_member(new.as_slice());
            proto.stamp(seq);
            Ok(())
        })
    }

    pub(crate) fn reassign_stamped(
        &self,
        vector: &Embedding,
        from: &PrototypeKey,
        to: &PrototypeKey,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<()> {
        self.ensure_contract(vector)?;
        if from == to {
            // unassign + assign of the same vector leaves the row unchanged
            return self.with_slot(from, false, |proto| {
                proto.ensure_removable()?;
                let seq = stamp()?;
                proto.stamp(seq);
                Ok(())
            });
        }

        let from_slot = self.existing(from)?;
        let (to_slot, created) = self.get_or_create(to);

        let result = {
            let (mut from_guard, mut to_guard) = lock_pair(from, &from_slot, to, &to_slot);
            if from_guard.deleted {
                Err(EmbedError::PrototypeNotFound { key: from.clone() })
            } else if to_guard.deleted {
                // Lost a race with delete_prototype; the caller may retry.
                Err(EmbedError::PrototypeNotFound { key: to.clone() })
            } else {
                from_guard
                    .prototype
                    .ensure_removable()
                    .and_then(|()| stamp())
                    .map(|seq| {
                        from_guard.prototype.remove_member(vector.as_slice());
                        from_guard.prototype.stamp(seq);
                        to_guard.prototype.add_member(vector.as_slice());
                        to_guard.prototype.stamp(seq);
                    })
            }
        };

        if result.is_err() && created {
            self.discard_if_unused(to, &to_slot);
        }
        if result.is_ok() {
            tracing::debug!("[prototype] reassigned member from '{from}' to '{to}'");
        }
        result
    }

    /// Creates an empty prototype, or updates the descriptive fields of an
    /// existing one. Member counts and centroids are untouched.
    pub(crate) fn register_stamped(
        &self,
        key: &PrototypeKey,
        topic: Option<String>,
        document: Option<String>,
        metadata: PrototypeMetadata,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<()> {
        self.with_slot(key, true, |proto| {
            let seq = stamp()?;
            proto.describe(topic, document, metadata);
            proto.stamp(seq);
            Ok(())
        })
    }

    /// Overwrites the aggregate of a derived prototype (topic rollups).
    pub(crate) fn overwrite_stamped(
        &self,
        key: &PrototypeKey,
        mean: Vec<f64>,
        member_count: u64,
        metadata: PrototypeMetadata,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<()> {
        self.with_slot(key, true, |proto| {
            let seq = stamp()?;
            proto.overwrite(mean, member_count);
            proto.describe(None, None, metadata);
            proto.stamp(seq);
            Ok(())
        })
    }

    /// Administrative delete. Returns the removed row.
    pub(crate) fn delete_stamped(
        &self,
        key: &PrototypeKey,
        stamp: impl FnOnce() -> EmbedResult<u64>,
    ) -> EmbedResult<Prototype> {
        let slot = self.existing(key)?;
        let mut guard = slot.lock();
        if guard.deleted {
            return Err(EmbedError::PrototypeNotFound { key: key.clone() });
        }
        stamp()?;
        guard.deleted = true;
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        tracing::debug!("[prototype] deleted '{key}'");
        Ok(guard.prototype.clone())
    }

    pub fn delete(&self, key: &PrototypeKey) -> EmbedResult<Prototype> {
        self.delete_stamped(key, || Ok(0))
    }

    /// Clone of one row.
    pub fn get(&self, key: &PrototypeKey) -> Option<Prototype> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock();
        (!guard.deleted).then(|| guard.prototype.clone())
    }

    /// Member counts for several keys read under all of their locks at once,
    /// so an in-flight reassignment is seen either fully or not at all.
    pub fn member_counts(&self, keys: &[PrototypeKey]) -> Vec<Option<u64>> {
        let mut ordered: Vec<&PrototypeKey> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let slots: Vec<(&PrototypeKey, SlotRef)> = ordered
            .into_iter()
            .filter_map(|k| self.slots.get(k).map(|s| (k, Arc::clone(s.value()))))
            .collect();
        let guards: Vec<_> = slots.iter().map(|(k, s)| (*k, s.lock())).collect();

        keys.iter()
            .map(|key| {
                guards
                    .iter()
                    .find(|(k, _)| *k == key)
                    .filter(|(_, g)| !g.deleted)
                    .map(|(_, g)| g.prototype.member_count())
            })
            .collect()
    }

    /// Consistent copy of every row, taken with all row locks held.
    pub fn snapshot(&self) -> Vec<Prototype> {
        let mut slots: Vec<(PrototypeKey, SlotRef)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        let guards: Vec<_> = slots.iter().map(|(_, s)| s.lock()).collect();
        guards
            .iter()
            .filter(|g| !g.deleted)
            .map(|g| g.prototype.clone())
            .collect()
    }

    /// Rows whose centroid is defined, with that centroid.
    pub fn centroids(&self) -> Vec<(PrototypeKey, Embedding)> {
        self.snapshot()
            .into_iter()
            .filter_map(|p| p.centroid().map(|c| (p.key().clone(), c)))
            .collect()
    }

    /// Runs `f` on a row if `seq` has not been applied to it yet. Used by
    /// journal replay; missing rows are created when `create` is set.
    pub(crate) fn apply_replayed(
        &self,
        key: &PrototypeKey,
        seq: u64,
        create: bool,
        f: impl FnOnce(&mut Prototype),
    ) -> bool {
        if !create && !self.slots.contains_key(key) {
            return false;
        }
        self.with_slot(key, create, |proto| {
            if proto.seq() >= seq {
                return Ok(false);
            }
            f(proto);
            proto.stamp(seq);
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Journal replay of a delete: skipped when the row already reflects a
    /// later entry.
    pub(crate) fn delete_replayed(&self, key: &PrototypeKey, seq: u64) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = slot.lock();
        if guard.deleted || guard.prototype.seq() >= seq {
            return false;
        }
        guard.deleted = true;
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        true
    }

    fn ensure_contract(&self, vector: &Embedding) -> EmbedResult<()> {
        self.contract.validate(vector.as_slice())?;
        Ok(())
    }

    fn existing(&self, key: &PrototypeKey) -> EmbedResult<SlotRef> {
        self.slots
            .get(key)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| EmbedError::PrototypeNotFound { key: key.clone() })
    }

    fn get_or_create(&self, key: &PrototypeKey) -> (SlotRef, bool) {
        let mut created = false;
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Slot {
                    prototype: Prototype::new(key.clone()),
                    deleted: false,
                }))
            })
            .value()
            .clone();
        (slot, created)
    }

    /// Drops a row created for an operation that then failed, so failures
    /// leave no visible trace.
    fn discard_if_unused(&self, key: &PrototypeKey, slot: &SlotRef) {
        let mut guard = slot.lock();
        if !guard.deleted && guard.prototype.member_count() == 0 && guard.prototype.seq() == 0 {
            guard.deleted = true;
            self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
        }
    }

    fn with_slot<R>(
        &self,
        key: &PrototypeKey,
        create: bool,
        f: impl FnOnce(&mut Prototype) -> EmbedResult<R>,
    ) -> EmbedResult<R> {
        // A slot can be deleted between lookup and lock; creating callers
        // retry against the fresh entry.
        loop {
            let (slot, created) = if create {
                self.get_or_create(key)
            } else {
                (self.existing(key)?, false)
            };

            let mut guard = slot.lock();
            if guard.deleted {
                if create {
                    continue;
                }
                return Err(EmbedError::PrototypeNotFound { key: key.clone() });
            }

            let result = f(&mut guard.prototype);
            drop(guard);
            if result.is_err() && created {
                self.discard_if_unused(key, &slot);
            }
            return result;
        }
    }
}

fn lock_pair<'a>(
    a_key: &PrototypeKey,
    a: &'a SlotRef,
    b_key: &PrototypeKey,
    b: &'a SlotRef,
) -> (
    parking_lot::MutexGuard<'a, Slot>,
    parking_lot::MutexGuard<'a, Slot>,
) {
    if a_key < b_key {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}
