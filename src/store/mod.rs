mod memory;
mod wal_store;

pub use memory::InMemoryStore;
pub use wal_store::WalStore;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Reservation, ResourceId, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stale write for {id}: expected version {expected:?}, found {actual:?}")]
    VersionMismatch {
        id: Ulid,
        expected: Option<u64>,
        actual: Option<u64>,
    },
}

/// System of record for reservations. The slot index is derived from it.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Every reservation, in any status, occupying the resource-day either as
    /// primary resource or as attached equipment.
    async fn load(&self, kind: ResourceKind, resource_id: ResourceId, day: NaiveDate) -> Result<Vec<Reservation>, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Write `reservation` if the stored version equals `expected_version`
    /// (`None` = must not exist yet). Returns the new version.
    async fn commit(&self, reservation: &Reservation, expected_version: Option<u64>) -> Result<u64, StoreError>;

    /// Ids of approved reservations whose day + end is not after `now`.
    async fn approved_ended_by(&self, now: NaiveDateTime) -> Result<Vec<Ulid>, StoreError>;
}
