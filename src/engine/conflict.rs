use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, ValidationError};

/// Result of a read-only availability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Available,
    Conflict { with: Ulid },
}

impl CheckOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, CheckOutcome::Available)
    }
}

/// First indexed reservation overlapping `span`, ignoring `exclude`.
///
/// Entries are sorted by start, so the walk stops at the first entry whose
/// start is at or past `span.end`.
pub(crate) fn find_conflict(slots: &DaySlots, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    for entry in &slots.entries {
        if entry.span.start >= span.end {
            break;
        }
        if Some(entry.reservation_id) == exclude || !entry.status.holds_slot() {
            continue;
        }
        if entry.span.overlaps(span) {
            return Some(entry.reservation_id);
        }
    }
    None
}

pub(crate) fn check_no_conflict(slots: &DaySlots, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    if slots.entries.len() >= MAX_ENTRIES_PER_DAY {
        return Err(ValidationError::LimitExceeded("too many reservations on resource-day").into());
    }
    match find_conflict(slots, span, exclude) {
        Some(with) => Err(EngineError::Conflict {
            with,
            kind: slots.key.kind,
            resource_id: slots.key.resource_id,
        }),
        None => Ok(()),
    }
}

pub(crate) fn outcome(slots: &DaySlots, span: &Span, exclude: Option<Ulid>) -> CheckOutcome {
    match find_conflict(slots, span, exclude) {
        Some(with) => CheckOutcome::Conflict { with },
        None => CheckOutcome::Available,
    }
}
