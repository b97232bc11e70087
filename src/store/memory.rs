use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;
use crate::status::Status;

use super::{ReservationStore, StoreError};

pub struct InMemoryStore {
    records: DashMap<Ulid, Reservation>,
    /// Resource-day → reservations occupying it (primary or equipment).
    by_day: DashMap<DayKey, Vec<Ulid>>,
    /// Approved reservations ordered by end time, for the sweeper.
    approved_ends: Mutex<BTreeSet<(NaiveDateTime, Ulid)>>,
    available: AtomicBool,
}

fn approved_end(r: &Reservation) -> Option<(NaiveDateTime, Ulid)> {
    (r.status == Status::Approved).then(|| (r.ends_at(), r.id))
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_day: DashMap::new(),
            approved_ends: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".into()))
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn version_of(&self, id: &Ulid) -> Option<u64> {
        self.records.get(id).map(|r| r.version)
    }

    /// Compare-and-swap on the version. Returns the version to write.
    pub(crate) fn next_version(&self, id: &Ulid, expected: Option<u64>) -> Result<u64, StoreError> {
        let actual = self.version_of(id);
        if actual != expected {
            return Err(StoreError::VersionMismatch { id: *id, expected, actual });
        }
        Ok(actual.map_or(1, |v| v + 1))
    }

    /// Unconditional write of an already-versioned record.
    pub(crate) fn put(&self, record: Reservation) {
        let old_keys = match self.records.entry(record.id) {
            Entry::Occupied(mut slot) => {
                self.track_end(Some(slot.get()), &record);
                let old = slot.get().day_keys();
                slot.insert(record.clone());
                old
            }
            Entry::Vacant(slot) => {
                self.track_end(None, &record);
                slot.insert(record.clone());
                Vec::new()
            }
        };
        self.reindex(record.id, &old_keys, &record.day_keys());
    }

    pub(crate) fn snapshot(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    /// Keep `approved_ends` in step with a write. Called under the record's
    /// entry lock.
    fn track_end(&self, old: Option<&Reservation>, new: &Reservation) {
        let (old, new) = (old.and_then(approved_end), approved_end(new));
        if old == new {
            return;
        }
        let mut ends = self.approved_ends.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = old {
            ends.remove(&key);
        }
        if let Some(key) = new {
            ends.insert(key);
        }
    }

    fn reindex(&self, id: Ulid, old_keys: &[DayKey], new_keys: &[DayKey]) {
        for key in old_keys.iter().filter(|k| !new_keys.contains(k)) {
            if let Some(mut ids) = self.by_day.get_mut(key) {
                ids.retain(|x| *x != id);
            }
        }
        for key in new_keys {
            let mut ids = self.by_day.entry(*key).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn load(&self, kind: ResourceKind, resource_id: ResourceId, day: NaiveDate) -> Result<Vec<Reservation>, StoreError> {
        self.ensure_available()?;
        let key = DayKey::new(kind, resource_id, day);
        let ids = self.by_day.get(&key).map(|e| e.value().clone()).unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        self.ensure_available()?;
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn commit(&self, reservation: &Reservation, expected_version: Option<u64>) -> Result<u64, StoreError> {
        self.ensure_available()?;
        let mut record = reservation.clone();
        // The entry lock makes the version check and the write one step.
        let old_keys = match self.records.entry(reservation.id) {
            Entry::Occupied(mut slot) => {
                let actual = slot.get().version;
                if expected_version != Some(actual) {
                    return Err(StoreError::VersionMismatch {
                        id: reservation.id,
                        expected: expected_version,
                        actual: Some(actual),
                    });
                }
                record.version = actual + 1;
                self.track_end(Some(slot.get()), &record);
                let old = slot.get().day_keys();
                slot.insert(record.clone());
                old
            }
            Entry::Vacant(slot) => {
                if expected_version.is_some() {
                    return Err(StoreError::VersionMismatch {
                        id: reservation.id,
                        expected: expected_version,
                        actual: None,
                    });
                }
                record.version = 1;
                self.track_end(None, &record);
                slot.insert(record.clone());
                Vec::new()
            }
        };
        self.reindex(record.id, &old_keys, &record.day_keys());
        Ok(record.version)
    }

    async fn approved_ended_by(&self, now: NaiveDateTime) -> Result<Vec<Ulid>, StoreError> {
        self.ensure_available()?;
        let ends = self.approved_ends.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<Ulid> = ends.range(..=(now, Ulid(u128::MAX))).map(|(_, id)| *id).collect();
        drop(ends);
        ids.sort();
        Ok(ids)
    }
}
