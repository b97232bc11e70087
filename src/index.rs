use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedDaySlots = Arc<RwLock<DaySlots>>;

/// Per resource-day index of reservations that currently hold a slot.
///
/// Holds exactly the `approved` reservations: upserting anything else
/// removes it. Each resource-day sits behind its own lock, which is also the
/// unit of mutual exclusion for check-then-write sequences.
pub struct SlotIndex {
    days: DashMap<DayKey, SharedDaySlots>,
    /// Reverse lookup: reservation id → resource-days it is indexed on.
    placements: DashMap<Ulid, Vec<DayKey>>,
}

/// Write guards over a set of resource-days, sorted by key.
pub struct DayGuards {
    guards: Vec<OwnedRwLockWriteGuard<DaySlots>>,
}

impl DayGuards {
    fn position(&self, key: &DayKey) -> Option<usize> {
        self.guards.binary_search_by(|g| g.key.cmp(key)).ok()
    }

    pub fn get(&self, key: &DayKey) -> Option<&DaySlots> {
        self.position(key).map(|i| &*self.guards[i])
    }

    pub fn get_mut(&mut self, key: &DayKey) -> Option<&mut DaySlots> {
        self.position(key).map(|i| &mut *self.guards[i])
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DaySlots> {
        self.guards.iter_mut().map(|g| &mut **g)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Default for SlotIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotIndex {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            placements: DashMap::new(),
        }
    }

    /// Get or create the slot list for a resource-day.
    pub fn day(&self, key: DayKey) -> SharedDaySlots {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySlots::new(key))))
            .value()
            .clone()
    }

    /// Write-lock every given resource-day. Keys are sorted and deduplicated
    /// first so that concurrent callers always acquire in the same order.
    pub async fn lock_days(&self, keys: &[DayKey]) -> DayGuards {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.day(key).write_owned().await);
        }
        DayGuards { guards }
    }

    /// Fill a freshly created day from the system of record.
    pub fn hydrate(&self, slots: &mut DaySlots, records: &[Reservation]) {
        for r in records.iter().filter(|r| r.status.holds_slot()) {
            if !r.day_keys().contains(&slots.key) {
                continue;
            }
            slots.insert_entry(SlotEntry {
                reservation_id: r.id,
                span: r.span,
                status: r.status,
            });
            let mut placed = self.placements.entry(r.id).or_default();
            if !placed.contains(&slots.key) {
                placed.push(slots.key);
            }
        }
        slots.loaded = true;
    }

    /// Bring the index in line with `reservation` using locks the caller
    /// already holds. Every previous placement and every key the reservation
    /// occupies must be among `guards`.
    pub fn apply(&self, guards: &mut DayGuards, reservation: &Reservation) {
        self.unplace(guards, reservation.id);
        if !reservation.status.holds_slot() {
            return;
        }
        let keys = reservation.day_keys();
        for key in &keys {
            match guards.get_mut(key) {
                Some(slots) => slots.insert_entry(SlotEntry {
                    reservation_id: reservation.id,
                    span: reservation.span,
                    status: reservation.status,
                }),
                None => debug_assert!(false, "apply without lock on {key}"),
            }
        }
        self.placements.insert(reservation.id, keys);
    }

    fn unplace(&self, guards: &mut DayGuards, id: Ulid) {
        let Some((_, keys)) = self.placements.remove(&id) else {
            return;
        };
        for key in keys {
            if let Some(slots) = guards.get_mut(&key) {
                slots.remove_entry(id);
            }
        }
    }

    /// Resource-days `id` is currently indexed on.
    pub fn placements_of(&self, id: Ulid) -> Vec<DayKey> {
        self.placements
            .get(&id)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Insert or update one reservation, taking the locks it needs.
    pub async fn upsert(&self, reservation: &Reservation) {
        let mut keys = self.placements_of(reservation.id);
        keys.extend(reservation.day_keys());
        let mut guards = self.lock_days(&keys).await;
        self.apply(&mut guards, reservation);
    }

    /// Drop every entry of `id`. Unknown ids are a no-op.
    pub async fn remove(&self, id: Ulid) {
        let keys = self.placements_of(id);
        if keys.is_empty() {
            return;
        }
        let mut guards = self.lock_days(&keys).await;
        self.unplace(&mut guards, id);
    }

    /// Indexed slots of one resource-day, sorted by start.
    pub async fn query(&self, kind: ResourceKind, resource_id: ResourceId, day: NaiveDate) -> Vec<SlotEntry> {
        let key = DayKey::new(kind, resource_id, day);
        let Some(slots) = self.days.get(&key).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = slots.read().await;
        guard.entries.clone()
    }

    /// Forget resource-days strictly before `day` that hold nothing.
    /// Returns how many were dropped.
    pub fn evict_before(&self, day: NaiveDate) -> usize {
        let before = self.days.len();
        self.days.retain(|key, slots| {
            if key.day >= day {
                return true;
            }
            // Anyone holding a clone may be about to lock it; evicting would
            // let a second lock for the same key appear.
            if Arc::strong_count(slots) > 1 {
                return true;
            }
            slots.try_read().map_or(true, |guard| !guard.entries.is_empty())
        });
        before - self.days.len()
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }
}
