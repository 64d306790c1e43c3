//! Change-event reconciliation.
//!
//! Each synchronized collection keeps its rows in a [`RecordStore`]: a map
//! of decoded records plus an eagerly maintained ordering. Live
//! [`ChangeEvent`]s and bulk replaces funnel through the store so that
//! every mutation path shares the same merge semantics:
//!
//! * **Insert** of an id that is already present is treated as an update.
//!   Re-delivered events are therefore idempotent, and server echoes of
//!   optimistic writes collapse into the rows they confirm.
//! * **Update** is a shallow field merge: only the keys present in the
//!   payload overwrite, so locally derived state (unread flags, rank
//!   scores, attached last messages) survives partial rows.
//! * **Delete** removes the record; deleting or updating an unknown id is
//!   a logged no-op ([`MergeError::UnknownEntity`]).
//!
//! The ordering is re-sorted only when a merge touches a field the
//! collection sorts by ([`Ordered::order_changed`]), with the record id as
//! a stable tiebreak so equal keys produce a deterministic sequence.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;
use veranda_core::{ChangeEvent, ChangeOp, CoreError, Row};

pub mod chats;
pub mod feed;
pub mod notifications;

// ─────────────────────────────────────────────────────────────────────────────
// Record traits
// ─────────────────────────────────────────────────────────────────────────────

/// A row type that can live in a [`RecordStore`].
pub trait Record: Clone + Serialize + DeserializeOwned + Send + 'static {
    /// Typed id for this collection.
    type Id: Copy + Eq + Ord + Hash + Send + fmt::Display + 'static;

    /// The record's own id.
    fn record_id(&self) -> Self::Id;

    /// Wrap a raw entity id in the collection's id type.
    fn id_from_uuid(id: Uuid) -> Self::Id;

    /// Recompute locally derived fields after a merge. Default: nothing.
    fn refresh_derived(&mut self) {}
}

/// Ordering policy for a collection.
pub trait Ordered: Record {
    /// Relative order of two records, before the id tiebreak.
    fn order_cmp(a: &Self, b: &Self) -> Ordering;

    /// Whether a merge moved the record with respect to `order_cmp`.
    ///
    /// Merges that only touch non-sort fields keep the current sequence.
    fn order_changed(before: &Self, after: &Self) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// Merge errors and outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Why a change event could not be applied.
///
/// These never abort reconciliation; callers log them and move on, and a
/// later bulk replace restores whatever state the skipped event carried.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Update or delete for an id the store has never seen.
    #[error("{op} for unknown entity {entity}")]
    UnknownEntity {
        /// Operation that referenced the missing record.
        op: ChangeOp,
        /// The entity id as reported by the event.
        entity: Uuid,
    },
    /// The payload did not decode into the collection's record type.
    #[error("merge decode failed: {message}")]
    Decode {
        /// Decoder diagnostic.
        message: String,
    },
}

impl MergeError {
    fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<CoreError> for MergeError {
    fn from(error: CoreError) -> Self {
        Self::Decode {
            message: error.to_string(),
        }
    }
}

/// What applying a single change event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new record entered the store.
    Inserted,
    /// An existing record was merged into.
    Updated,
    /// A record left the store.
    Removed,
}

/// Counters summarizing a bulk replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Rows that created new records.
    pub inserted: usize,
    /// Rows merged into records already present.
    pub merged: usize,
    /// Records dropped because the authoritative set no longer has them.
    pub removed: usize,
    /// Rows skipped because they had no usable id or failed to decode.
    pub skipped: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shallow merge
// ─────────────────────────────────────────────────────────────────────────────

/// Shallow-merge a payload into an existing record.
///
/// Keys present in `patch` overwrite the serialized record wholesale
/// (including nested values, which are replaced, not recursed into); keys
/// absent from the patch keep their current value. Derived fields are
/// refreshed on the merged result.
pub fn merge_row<R: Record>(existing: &R, patch: &Row) -> Result<R, MergeError> {
    let mut value =
        serde_json::to_value(existing).map_err(|error| MergeError::decode(error.to_string()))?;
    let Some(object) = value.as_object_mut() else {
        return Err(MergeError::decode("record did not serialize to an object"));
    };
    for (key, field) in patch {
        object.insert(key.clone(), field.clone());
    }
    let mut merged: R =
        serde_json::from_value(value).map_err(|error| MergeError::decode(error.to_string()))?;
    merged.refresh_derived();
    Ok(merged)
}

fn row_entity_id(row: &Row) -> Option<Uuid> {
    match row.get("id") {
        Some(Value::String(raw)) => raw.parse().ok(),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record store
// ─────────────────────────────────────────────────────────────────────────────

/// An ordered collection of records keyed by id.
#[derive(Debug)]
pub struct RecordStore<R: Ordered> {
    records: HashMap<R::Id, R>,
    order: Vec<R::Id>,
}

impl<R: Ordered> Default for RecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Ordered> RecordStore<R> {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: R::Id) -> bool {
        self.records.contains_key(&id)
    }

    /// Borrow a record by id.
    pub fn get(&self, id: R::Id) -> Option<&R> {
        self.records.get(&id)
    }

    /// Records in collection order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Clone the records out in collection order.
    pub fn snapshot(&self) -> Vec<R> {
        self.iter().cloned().collect()
    }

    /// Apply one live change event.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<Applied, MergeError> {
        let id = R::id_from_uuid(event.entity_id);
        match event.op {
            ChangeOp::Insert => {
                if self.records.contains_key(&id) {
                    // Re-delivered or echoed insert: merge like an update.
                    self.merge_into(id, &event.payload)?;
                    Ok(Applied::Updated)
                } else {
                    let mut record: R = serde_json::from_value(Value::Object(event.payload.clone()))
                        .map_err(|error| MergeError::decode(error.to_string()))?;
                    record.refresh_derived();
                    self.insert(record);
                    Ok(Applied::Inserted)
                }
            }
            ChangeOp::Update => {
                if !self.records.contains_key(&id) {
                    return Err(MergeError::UnknownEntity {
                        op: event.op,
                        entity: event.entity_id,
                    });
                }
                self.merge_into(id, &event.payload)?;
                Ok(Applied::Updated)
            }
            ChangeOp::Delete => match self.remove(id) {
                Some(_) => Ok(Applied::Removed),
                None => Err(MergeError::UnknownEntity {
                    op: event.op,
                    entity: event.entity_id,
                }),
            },
        }
    }

    /// Apply a single authoritative row: merge when the id is known,
    /// decode fresh otherwise. Used for hydrated point reads and rows
    /// returned by confirmed writes.
    pub fn apply_row(&mut self, row: &Row) -> Result<Applied, MergeError> {
        let Some(entity) = row_entity_id(row) else {
            return Err(MergeError::decode("row has no usable id column"));
        };
        let id = R::id_from_uuid(entity);
        if self.records.contains_key(&id) {
            self.merge_into(id, row)?;
            Ok(Applied::Updated)
        } else {
            let mut record: R = serde_json::from_value(Value::Object(row.clone()))
                .map_err(|error| MergeError::decode(error.to_string()))?;
            record.refresh_derived();
            self.insert(record);
            Ok(Applied::Inserted)
        }
    }

    /// Replace the collection with an authoritative row set.
    ///
    /// Rows for known ids are merged with update semantics so derived and
    /// locally attached state survives; unknown rows are decoded fresh;
    /// records absent from `rows` are dropped. Undecodable rows are counted
    /// and skipped, never fatal.
    pub fn apply_bulk_replace(&mut self, rows: &[Row]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        let mut keep: HashSet<R::Id> = HashSet::with_capacity(rows.len());

        for row in rows {
            let Some(entity) = row_entity_id(row) else {
                outcome.skipped += 1;
                continue;
            };
            let id = R::id_from_uuid(entity);
            if self.records.contains_key(&id) {
                match self.merge_into(id, row) {
                    Ok(()) => {
                        keep.insert(id);
                        outcome.merged += 1;
                    }
                    Err(_) => outcome.skipped += 1,
                }
            } else {
                match serde_json::from_value::<R>(Value::Object(row.clone())) {
                    Ok(mut record) => {
                        record.refresh_derived();
                        keep.insert(record.record_id());
                        self.records.insert(record.record_id(), record);
                        outcome.inserted += 1;
                    }
                    Err(_) => outcome.skipped += 1,
                }
            }
        }

        let before = self.records.len();
        self.records.retain(|id, _| keep.contains(id));
        outcome.removed = before - self.records.len();

        self.order = self.records.keys().copied().collect();
        self.resort();
        outcome
    }

    /// Insert or replace a record directly (optimistic writes, hydration).
    pub fn upsert(&mut self, record: R) -> Option<R> {
        let id = record.record_id();
        match self.records.get(&id) {
            Some(previous) => {
                let moved = R::order_changed(previous, &record);
                let previous = self.records.insert(id, record);
                if moved {
                    self.resort();
                }
                previous
            }
            None => {
                self.insert(record);
                None
            }
        }
    }

    /// Mutate a record in place. The closure returns whether it touched a
    /// sort-relevant field.
    pub fn update_with(&mut self, id: R::Id, apply: impl FnOnce(&mut R) -> bool) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        let moved = apply(record);
        record.refresh_derived();
        if moved {
            self.resort();
        }
        true
    }

    /// Remove a record by id.
    pub fn remove(&mut self, id: R::Id) -> Option<R> {
        let removed = self.records.remove(&id)?;
        self.order.retain(|held| *held != id);
        Some(removed)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }

    fn merge_into(&mut self, id: R::Id, patch: &Row) -> Result<(), MergeError> {
        let Some(existing) = self.records.get(&id) else {
            return Err(MergeError::decode("merge target vanished"));
        };
        let merged = merge_row(existing, patch)?;
        let moved = R::order_changed(existing, &merged);
        self.records.insert(id, merged);
        if moved {
            self.resort();
        }
        Ok(())
    }

    fn insert(&mut self, record: R) {
        let id = record.record_id();
        self.records.insert(id, record);
        self.order.push(id);
        self.resort();
    }

    fn resort(&mut self) {
        let records = &self.records;
        self.order.sort_by(|a, b| {
            match (records.get(a), records.get(b)) {
                (Some(ra), Some(rb)) => R::order_cmp(ra, rb).then_with(|| a.cmp(b)),
                // Unreachable while order mirrors the map; sort holes last.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.cmp(b),
            }
        });
    }
}
