use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::model::*;

use super::availability::free_spans;
use super::conflict::{outcome, CheckOutcome};
use super::{Engine, EngineError};

impl Engine {
    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.fetch(id).await
    }

    /// Would `[start, end)` on this resource-day be bookable right now?
    /// Read-only: the answer can be stale by the time a booking is submitted,
    /// which is why `book` checks again under the write lock.
    pub async fn check(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        day: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Ulid>,
    ) -> Result<CheckOutcome, EngineError> {
        let span = Span::try_new(start, end)?;
        self.ensure_bookable(kind, resource_id)?;
        let slots = self.read_hydrated(DayKey::new(kind, resource_id, day)).await?;
        let result = outcome(&slots, &span, exclude);
        if !result.is_available() {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        }
        Ok(result)
    }

    /// Approved reservations on one resource-day, sorted by start.
    pub async fn day_schedule(&self, kind: ResourceKind, resource_id: ResourceId, day: NaiveDate) -> Result<Vec<SlotEntry>, EngineError> {
        let slots = self.read_hydrated(DayKey::new(kind, resource_id, day)).await?;
        Ok(slots.entries.clone())
    }

    /// Free spans of a resource-day inside the opening window
    /// `[open, close)`, skipping gaps shorter than `min_duration`.
    pub async fn availability(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        day: NaiveDate,
        open: NaiveTime,
        close: NaiveTime,
        min_duration: Option<TimeDelta>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = Span::try_new(open, close)?;
        self.ensure_bookable(kind, resource_id)?;
        let slots = self.read_hydrated(DayKey::new(kind, resource_id, day)).await?;
        Ok(free_spans(&slots, &window, min_duration))
    }
}
