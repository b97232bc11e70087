use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Reservation lifecycle.
///
/// ```text
/// pending ──approve──▶ approved ──sweep──▶ passed
///    │                    │
///    └──────cancel────────┴──────────────▶ canceled
/// ```
///
/// `passed` and `canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Approved,
    Canceled,
    Passed,
}

/// Outcome of a legal transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changes; the caller must commit and apply side effects.
    Apply,
    /// Already in the requested state and the repeat is allowed (cancel twice).
    NoOp,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Approved => "approved",
            Status::Canceled => "canceled",
            Status::Passed => "passed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Canceled | Status::Passed)
    }

    /// Whether a reservation in this state holds its slot in the index.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Status::Approved)
    }

    /// Validate `self -> to` against the transition table.
    pub fn transition(self, to: Status) -> Result<Transition, EngineError> {
        match (self, to) {
            (Status::Pending, Status::Approved)
            | (Status::Pending, Status::Canceled)
            | (Status::Approved, Status::Canceled)
            | (Status::Approved, Status::Passed) => Ok(Transition::Apply),
            (Status::Canceled, Status::Canceled) => Ok(Transition::NoOp),
            (from, to) => Err(EngineError::InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
