use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::model::{DocumentPatch, PhotoChange, PhotoRef, Record, RecordId, RecordPayload};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { first_seen_index: u64 },
    Updated,
}

/// Canonical set of currently-known records, one per id.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<RecordId, Record>,
    next_index: u64,
    revision: u64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    /// All known records, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Bumped by every applied notification. A write issued at revision `n`
    /// never overrides a value a notification set after `n`.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Inserts an unseen id with the next first-seen index, or merges the
    /// payload field-by-field into the existing record.
    pub fn upsert(&mut self, id: &RecordId, payload: &RecordPayload) -> UpsertOutcome {
        self.revision += 1;
        let revision = self.revision;

        let (record, outcome) = match self.records.entry(id.clone()) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                record.fields.merge(&payload.fields);
                trace!(%id, revision, "record merged");
                (record, UpsertOutcome::Updated)
            }
            Entry::Vacant(entry) => {
                let first_seen_index = self.next_index;
                self.next_index += 1;
                trace!(%id, first_seen_index, revision, "record inserted");
                let record = entry.insert(Record {
                    id: id.clone(),
                    fields: payload.fields.clone(),
                    photo_ref: None,
                    first_seen_index,
                    field_revisions: BTreeMap::new(),
                    photo_revision: 0,
                });
                (record, UpsertOutcome::Inserted { first_seen_index })
            }
        };

        for (field, _) in payload.fields.iter() {
            record.field_revisions.insert(field, revision);
        }
        if !payload.photo.is_untouched() {
            apply_photo(&mut record.photo_ref, &payload.photo);
            record.photo_revision = revision;
        }
        outcome
    }

    /// Merges a local write confirmed by the remote side. `issued_at` is the
    /// [`revision`](Self::revision) the write was issued at; values that a
    /// later notification has set are kept. Never resurrects a removed record.
    pub fn apply_confirmed(
        &mut self,
        id: &RecordId,
        patch: &DocumentPatch,
        issued_at: u64,
    ) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };

        let mut superseded = 0usize;
        for (field, value) in patch.fields.iter() {
            if record.field_revisions.get(&field).is_some_and(|r| *r > issued_at) {
                superseded += 1;
            } else {
                record.fields.set(field, value);
            }
        }
        if !patch.photo.is_untouched() {
            if record.photo_revision > issued_at {
                superseded += 1;
            } else {
                apply_photo(&mut record.photo_ref, &patch.photo);
            }
        }
        if superseded > 0 {
            debug!(%id, superseded, issued_at, "confirmed values already superseded by the feed");
        }
        true
    }

    /// Idempotent: removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        self.records.remove(id)
    }
}

fn apply_photo(slot: &mut Option<PhotoRef>, change: &PhotoChange) {
    match change {
        PhotoChange::Untouched => {}
        PhotoChange::Set(photo) => *slot = Some(photo.clone()),
        PhotoChange::Clear => *slot = None,
    }
}
