mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use conflict::CheckOutcome;
pub use error::{EngineError, ValidationError};
pub use mutations::BookingRequest;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::info;
use ulid::Ulid;

use crate::auth::Actor;
use crate::clock::Clock;
use crate::index::{DayGuards, SlotIndex};
use crate::model::*;
use crate::notify::NotificationDispatcher;
use crate::status::Status;
use crate::store::ReservationStore;
use crate::sync::KeyedMutex;

/// Which bookings start out approved.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    /// Resource kinds booked straight into `approved` for everyone.
    pub auto_approve: Vec<ResourceKind>,
}

impl ApprovalPolicy {
    pub fn initial_status(&self, actor: &Actor, kind: ResourceKind) -> Status {
        if actor.bypasses_approval() || self.auto_approve.contains(&kind) {
            Status::Approved
        } else {
            Status::Pending
        }
    }
}

/// Reservation scheduling core.
///
/// Lock order, always: per-reservation mutex, then resource-day write locks
/// in key order, then whatever the store takes internally.
pub struct Engine {
    pub index: SlotIndex,
    store: Arc<dyn ReservationStore>,
    notify: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    policy: ApprovalPolicy,
    catalog: DashMap<(ResourceKind, ResourceId), ResourceInfo>,
    /// Serializes transitions of one existing reservation.
    serial: KeyedMutex<Ulid>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        notify: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            index: SlotIndex::new(),
            store,
            notify,
            clock,
            policy,
            catalog: DashMap::new(),
            serial: KeyedMutex::new(),
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    // ── Resource catalog ─────────────────────────────────────

    /// Register (or rename) a bookable resource. New resources are active.
    pub fn register_resource(&self, kind: ResourceKind, id: ResourceId, name: Option<String>) {
        self.catalog
            .entry((kind, id))
            .and_modify(|info| info.name = name.clone())
            .or_insert_with(|| ResourceInfo {
                kind,
                id,
                name,
                active: true,
            });
    }

    /// Load a whole catalog, e.g. the resources file read at startup.
    pub fn register_all(&self, resources: impl IntoIterator<Item = ResourceInfo>) -> usize {
        let mut n = 0;
        for info in resources {
            self.catalog.insert((info.kind, info.id), info);
            n += 1;
        }
        n
    }

    pub fn set_resource_active(&self, kind: ResourceKind, id: ResourceId, active: bool) -> Result<(), EngineError> {
        let mut info = self
            .catalog
            .get_mut(&(kind, id))
            .ok_or(ValidationError::UnknownResource { kind, id })?;
        info.active = active;
        info!("{kind} #{id} active={active}");
        Ok(())
    }

    pub fn resource(&self, kind: ResourceKind, id: ResourceId) -> Option<ResourceInfo> {
        self.catalog.get(&(kind, id)).map(|e| e.value().clone())
    }

    pub(crate) fn ensure_bookable(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ValidationError> {
        match self.catalog.get(&(kind, id)) {
            None => Err(ValidationError::UnknownResource { kind, id }),
            Some(info) if !info.active => Err(ValidationError::InactiveResource { kind, id }),
            Some(_) => Ok(()),
        }
    }

    // ── Shared plumbing ──────────────────────────────────────

    /// Current record from the system of record.
    pub(super) async fn fetch(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Write-lock resource-days in key order, filling any not yet loaded
    /// from the store while the lock is held.
    pub(super) async fn lock_hydrated(&self, keys: &[DayKey]) -> Result<DayGuards, EngineError> {
        let mut guards = self.index.lock_days(keys).await;
        for slots in guards.iter_mut() {
            if !slots.loaded {
                let key = slots.key;
                let records = self.store.load(key.kind, key.resource_id, key.day).await?;
                self.index.hydrate(slots, &records);
            }
        }
        Ok(guards)
    }

    /// Read lock on one resource-day, hydrated.
    pub(super) async fn read_hydrated(&self, key: DayKey) -> Result<OwnedRwLockReadGuard<DaySlots>, EngineError> {
        let shared = self.index.day(key);
        {
            let guard = shared.clone().read_owned().await;
            if guard.loaded {
                return Ok(guard);
            }
        }
        let mut guard = shared.write_owned().await;
        if !guard.loaded {
            let records = self.store.load(key.kind, key.resource_id, key.day).await?;
            self.index.hydrate(&mut guard, &records);
        }
        Ok(guard.downgrade())
    }

    /// Commit a new state of `current` and bring the index along, under
    /// locks the caller holds.
    pub(super) async fn commit_locked(
        &self,
        guards: &mut DayGuards,
        current: &Reservation,
        mut next: Reservation,
    ) -> Result<Reservation, EngineError> {
        next.version = self.store.commit(&next, Some(current.version)).await?;
        self.index.apply(guards, &next);
        Ok(next)
    }

    pub(super) fn emit(&self, kind: EventKind, reservation: &Reservation) {
        self.notify.dispatch(ReservationEvent {
            kind,
            reservation: reservation.clone(),
        });
    }

    pub(super) fn record_transition(&self, from: Status, to: Status) {
        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}
