use chrono::NaiveTime;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{ResourceId, ResourceKind, UserId};
use crate::status::Status;
use crate::store::StoreError;

/// Bad input. Raised before any index access and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("start {start} must be before end {end}")]
    EmptySpan { start: NaiveTime, end: NaiveTime },
    #[error("unknown resource: {kind} #{id}")]
    UnknownResource { kind: ResourceKind, id: ResourceId },
    #[error("resource is not bookable: {kind} #{id}")]
    InactiveResource { kind: ResourceKind, id: ResourceId },
    #[error("equipment #{0} listed more than once")]
    DuplicateEquipment(ResourceId),
    #[error("user #{0} is already the owner or a team member")]
    DuplicateTeamMember(UserId),
    #[error("reservation is {0} and can no longer be modified")]
    Closed(Status),
    #[error("only pending reservations can be offered another time; this one is {0}")]
    NotPending(Status),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("slot unavailable on {kind} #{resource_id}: conflicts with reservation {with}")]
    Conflict {
        with: Ulid,
        kind: ResourceKind,
        resource_id: ResourceId,
    },
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("user #{user_id} may not {action}")]
    Forbidden { user_id: UserId, action: &'static str },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// True when the user should pick another time rather than fix the input.
    pub fn is_slot_unavailable(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden { .. } => "forbidden",
            EngineError::Storage(_) => "storage",
        }
    }
}
