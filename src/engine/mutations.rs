use chrono::{NaiveDate, NaiveTime};
use futures::{StreamExt, stream};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::Actor;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::status::{Status, Transition};

use super::conflict::check_no_conflict;
use super::{Engine, EngineError, ValidationError};

/// A booking submission as it arrives from the HTTP layer.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub kind: ResourceKind,
    pub resource_id: ResourceId,
    pub day: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub equipment: Vec<ResourceId>,
    pub team: Vec<UserId>,
    pub note: Option<String>,
}

impl BookingRequest {
    pub fn new(kind: ResourceKind, resource_id: ResourceId, day: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            kind,
            resource_id,
            day,
            start,
            end,
            equipment: Vec::new(),
            team: Vec::new(),
            note: None,
        }
    }

    pub fn with_equipment(mut self, equipment: impl IntoIterator<Item = ResourceId>) -> Self {
        self.equipment = equipment.into_iter().collect();
        self
    }

    pub fn with_team(mut self, team: impl IntoIterator<Item = UserId>) -> Self {
        self.team = team.into_iter().collect();
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

fn validate_team(owner: UserId, team: &[UserId]) -> Result<(), ValidationError> {
    if team.len() > MAX_TEAM_SIZE {
        return Err(ValidationError::LimitExceeded("team too large"));
    }
    for (i, member) in team.iter().enumerate() {
        if *member == owner || team[..i].contains(member) {
            return Err(ValidationError::DuplicateTeamMember(*member));
        }
    }
    Ok(())
}

impl Engine {
    fn validate_request(&self, request: &BookingRequest, owner: UserId) -> Result<Span, ValidationError> {
        let span = Span::try_new(request.start, request.end)?;
        self.ensure_bookable(request.kind, request.resource_id)?;
        if request.equipment.len() > MAX_EQUIPMENT_PER_RESERVATION {
            return Err(ValidationError::LimitExceeded("too much equipment on one reservation"));
        }
        for (i, eq) in request.equipment.iter().enumerate() {
            let primary_dup = request.kind == ResourceKind::Equipment && *eq == request.resource_id;
            if primary_dup || request.equipment[..i].contains(eq) {
                return Err(ValidationError::DuplicateEquipment(*eq));
            }
            self.ensure_bookable(ResourceKind::Equipment, *eq)?;
        }
        validate_team(owner, &request.team)?;
        if let Some(ref note) = request.note
            && note.len() > MAX_NOTE_LEN {
                return Err(ValidationError::LimitExceeded("note too long"));
            }
        Ok(span)
    }

    /// Submit a booking. The conflict check and the write happen under the
    /// write locks of every resource-day involved: the primary resource and
    /// each equipment unit. All-or-nothing.
    pub async fn book(&self, actor: &Actor, request: BookingRequest) -> Result<Reservation, EngineError> {
        let result = self.book_inner(actor, request).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn book_inner(&self, actor: &Actor, request: BookingRequest) -> Result<Reservation, EngineError> {
        let span = self.validate_request(&request, actor.user_id)?;

        let mut reservation = Reservation {
            id: Ulid::new(),
            kind: request.kind,
            resource_id: request.resource_id,
            day: request.day,
            span,
            user_id: actor.user_id,
            status: self.policy.initial_status(actor, request.kind),
            created_at: self.clock.now_utc(),
            equipment: request.equipment,
            team: request.team,
            proposal: None,
            note: request.note,
            version: 0,
        };

        let keys = reservation.day_keys();
        let mut guards = self.lock_hydrated(&keys).await?;
        // Pending bookings are checked too: a slot already held by an
        // approved reservation is never worth queueing for.
        for key in &keys {
            if let Some(slots) = guards.get(key) {
                check_no_conflict(slots, &span, None)?;
            }
        }

        reservation.version = self.store.commit(&reservation, None).await?;
        self.index.apply(&mut guards, &reservation);
        drop(guards);

        info!(
            "booked {} on {} {} for user #{} ({})",
            reservation.id,
            reservation.primary_key(),
            reservation.span,
            reservation.user_id,
            reservation.status
        );
        let kind = if reservation.status == Status::Approved {
            EventKind::ReservationApproved
        } else {
            EventKind::ReservationRequested
        };
        self.emit(kind, &reservation);
        Ok(reservation)
    }

    /// `pending → approved`. Re-checks conflicts: a pending reservation never
    /// held its slot exclusively. On conflict the reservation stays pending.
    pub async fn approve(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        if !actor.can_moderate() {
            return Err(EngineError::Forbidden {
                user_id: actor.user_id,
                action: "approve reservations",
            });
        }
        let _serial = self.serial.lock(id).await;
        let current = self.fetch(id).await?;
        current.status.transition(Status::Approved)?;

        let keys = current.day_keys();
        let mut guards = self.lock_hydrated(&keys).await?;
        for key in &keys {
            if let Some(slots) = guards.get(key) {
                if let Err(e) = check_no_conflict(slots, &current.span, Some(id)) {
                    metrics::counter!(observability::APPROVAL_CONFLICTS_TOTAL).increment(1);
                    info!("approval of {id} blocked: {e}");
                    return Err(e);
                }
            }
        }

        let next = Reservation {
            status: Status::Approved,
            proposal: None,
            ..current.clone()
        };
        let approved = self.commit_locked(&mut guards, &current, next).await?;
        drop(guards);

        self.record_transition(current.status, Status::Approved);
        info!("approved {id} by user #{}", actor.user_id);
        self.emit(EventKind::ReservationApproved, &approved);
        Ok(approved)
    }

    /// `pending|approved → canceled` by the owner or a moderator. Frees the
    /// slot. Canceling twice returns the canceled reservation unchanged.
    pub async fn cancel(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let _serial = self.serial.lock(id).await;
        let current = self.fetch(id).await?;
        if !current.is_owned_by(actor.user_id) && !actor.can_moderate() {
            return Err(EngineError::Forbidden {
                user_id: actor.user_id,
                action: "cancel another user's reservation",
            });
        }
        self.cancel_locked(current).await
    }

    /// Caller holds the reservation's serial lock.
    async fn cancel_locked(&self, current: Reservation) -> Result<Reservation, EngineError> {
        if current.status.transition(Status::Canceled)? == Transition::NoOp {
            debug!("{} already canceled", current.id);
            return Ok(current);
        }

        let mut guards = self.lock_hydrated(&current.day_keys()).await?;
        let next = Reservation {
            status: Status::Canceled,
            proposal: None,
            ..current.clone()
        };
        let canceled = self.commit_locked(&mut guards, &current, next).await?;
        drop(guards);

        self.record_transition(current.status, Status::Canceled);
        info!("canceled {}", canceled.id);
        self.emit(EventKind::ReservationCanceled, &canceled);
        Ok(canceled)
    }

    /// Offer the owner of a pending reservation another slot. The slot must
    /// be free now but is not held until the owner accepts.
    pub async fn propose(
        &self,
        actor: &Actor,
        id: Ulid,
        day: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Reservation, EngineError> {
        if !actor.can_moderate() {
            return Err(EngineError::Forbidden {
                user_id: actor.user_id,
                action: "propose a new time",
            });
        }
        let proposal = Proposal {
            day,
            span: Span::try_new(start, end)?,
        };
        let _serial = self.serial.lock(id).await;
        let current = self.fetch(id).await?;
        if current.status != Status::Pending {
            return Err(ValidationError::NotPending(current.status).into());
        }

        let moved = current.moved_to(proposal);
        let mut keys = current.day_keys();
        keys.extend(moved.day_keys());
        let mut guards = self.lock_hydrated(&keys).await?;
        for key in moved.day_keys() {
            if let Some(slots) = guards.get(&key) {
                check_no_conflict(slots, &proposal.span, Some(id))?;
            }
        }

        let next = Reservation {
            proposal: Some(proposal),
            ..current.clone()
        };
        let proposed = self.commit_locked(&mut guards, &current, next).await?;
        drop(guards);

        info!("proposed {} {} for {id}", proposal.day, proposal.span);
        self.emit(EventKind::ReservationProposed, &proposed);
        Ok(proposed)
    }

    /// The owner's answer to a proposal: accept moves the reservation to the
    /// proposed slot and approves it; decline cancels it.
    pub async fn respond(&self, actor: &Actor, id: Ulid, accept: bool) -> Result<Reservation, EngineError> {
        let _serial = self.serial.lock(id).await;
        let current = self.fetch(id).await?;
        if !current.is_owned_by(actor.user_id) {
            return Err(EngineError::Forbidden {
                user_id: actor.user_id,
                action: "answer a proposal for another user's reservation",
            });
        }
        let target = if accept { Status::Approved } else { Status::Canceled };
        let Some(proposal) = current.proposal else {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: target,
            });
        };
        if !accept {
            return self.cancel_locked(current).await;
        }
        current.status.transition(Status::Approved)?;

        let moved = Reservation {
            status: Status::Approved,
            ..current.moved_to(proposal)
        };
        let mut keys = current.day_keys();
        keys.extend(moved.day_keys());
        let mut guards = self.lock_hydrated(&keys).await?;
        for key in moved.day_keys() {
            if let Some(slots) = guards.get(&key) {
                check_no_conflict(slots, &moved.span, Some(id))?;
            }
        }
        let approved = self.commit_locked(&mut guards, &current, moved).await?;
        drop(guards);

        self.record_transition(current.status, Status::Approved);
        info!("{id} accepted proposal {} {}", approved.day, approved.span);
        self.emit(EventKind::ReservationApproved, &approved);
        Ok(approved)
    }

    pub async fn add_team_member(&self, actor: &Actor, id: Ulid, member: UserId) -> Result<Reservation, EngineError> {
        self.edit_team(actor, id, |team, owner| {
            let mut next = team.to_vec();
            next.push(member);
            validate_team(owner, &next)?;
            Ok(next)
        })
        .await
    }

    /// Removing someone who is not on the team is a no-op.
    pub async fn remove_team_member(&self, actor: &Actor, id: Ulid, member: UserId) -> Result<Reservation, EngineError> {
        self.edit_team(actor, id, |team, _| Ok(team.iter().copied().filter(|m| *m != member).collect()))
            .await
    }

    async fn edit_team<F>(&self, actor: &Actor, id: Ulid, edit: F) -> Result<Reservation, EngineError>
    where
        F: FnOnce(&[UserId], UserId) -> Result<Vec<UserId>, ValidationError>,
    {
        let _serial = self.serial.lock(id).await;
        let current = self.fetch(id).await?;
        if !current.is_owned_by(actor.user_id) && !actor.can_moderate() {
            return Err(EngineError::Forbidden {
                user_id: actor.user_id,
                action: "edit another user's team",
            });
        }
        if current.status.is_terminal() {
            return Err(ValidationError::Closed(current.status).into());
        }
        let team = edit(&current.team, current.user_id)?;
        if team == current.team {
            return Ok(current);
        }
        let mut next = Reservation {
            team,
            ..current.clone()
        };
        // Membership has no slot implications; no day locks needed.
        next.version = self.store.commit(&next, Some(current.version)).await?;
        Ok(next)
    }

    /// `approved → passed` once the reservation has ended by the engine's
    /// clock. Returns `None` when there is nothing to do: the reservation was
    /// canceled first, is not approved, or has not ended yet.
    pub async fn mark_passed(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        let _serial = self.serial.lock(id).await;
        let current = self.fetch(id).await?;
        if current.status != Status::Approved {
            debug!("sweep skip {id}: {}", current.status);
            return Ok(None);
        }
        if current.ends_at() > self.clock.now() {
            debug!("sweep skip {id}: not ended");
            return Ok(None);
        }
        current.status.transition(Status::Passed)?;

        let mut guards = self.lock_hydrated(&current.day_keys()).await?;
        let next = Reservation {
            status: Status::Passed,
            ..current.clone()
        };
        let passed = self.commit_locked(&mut guards, &current, next).await?;
        drop(guards);

        self.record_transition(Status::Approved, Status::Passed);
        self.emit(EventKind::ReservationPassed, &passed);
        Ok(Some(passed))
    }

    /// One sweep pass: promote every approved reservation that has ended.
    /// Failures on single reservations are logged and left for the next pass.
    pub async fn sweep_passed(&self) -> Result<Vec<Ulid>, EngineError> {
        let now = self.clock.now();
        let candidates = self.store.approved_ended_by(now).await?;
        let results: Vec<(Ulid, Result<Option<Reservation>, EngineError>)> = stream::iter(candidates)
            .map(|id| async move { (id, self.mark_passed(id).await) })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        let mut passed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(Some(_)) => passed.push(id),
                Ok(None) => {}
                Err(e) => warn!("sweep failed for {id}: {e}"),
            }
        }
        passed.sort();
        metrics::counter!(observability::SWEEP_PASSED_TOTAL).increment(passed.len() as u64);
        if !passed.is_empty() {
            info!("sweep marked {} reservation(s) passed", passed.len());
        }
        let evicted = self.index.evict_before(now.date());
        if evicted > 0 {
            debug!("evicted {evicted} idle resource-days");
        }
        Ok(passed)
    }
}
