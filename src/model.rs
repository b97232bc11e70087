use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::ValidationError;
use crate::status::Status;

/// Identifier of a studio, cowork table or equipment unit in the system of record.
pub type ResourceId = u64;
pub type UserId = u64;

/// Bookable resource families. Each kind is its own conflict namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Studio,
    Cowork,
    Equipment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Studio, ResourceKind::Cowork, ResourceKind::Equipment];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Studio => "studio",
            ResourceKind::Cowork => "cowork",
            ResourceKind::Equipment => "equipment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "studio" => Ok(ResourceKind::Studio),
            "cowork" => Ok(ResourceKind::Cowork),
            "equipment" => Ok(ResourceKind::Equipment),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Validating constructor used at every entry point that takes caller input.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::EmptySpan { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// One resource on one calendar day: the unit of locking and indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub kind: ResourceKind,
    pub resource_id: ResourceId,
    pub day: NaiveDate,
}

impl DayKey {
    pub fn new(kind: ResourceKind, resource_id: ResourceId, day: NaiveDate) -> Self {
        Self { kind, resource_id, day }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.kind, self.resource_id, self.day)
    }
}

/// Alternative slot offered by staff for a pending reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub day: NaiveDate,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub resource_id: ResourceId,
    pub day: NaiveDate,
    pub span: Span,
    pub user_id: UserId,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    /// Equipment units booked alongside the primary resource, same day and span.
    pub equipment: Vec<ResourceId>,
    /// Team members attached to the reservation. Membership only.
    pub team: Vec<UserId>,
    pub proposal: Option<Proposal>,
    pub note: Option<String>,
    /// Optimistic concurrency token assigned by the store; 0 = never committed.
    pub version: u64,
}

impl Reservation {
    pub fn primary_key(&self) -> DayKey {
        DayKey::new(self.kind, self.resource_id, self.day)
    }

    /// Every resource-day this reservation occupies: the primary resource
    /// followed by one entry per equipment unit.
    pub fn day_keys(&self) -> Vec<DayKey> {
        let mut keys = Vec::with_capacity(1 + self.equipment.len());
        keys.push(self.primary_key());
        keys.extend(
            self.equipment
                .iter()
                .map(|&eq| DayKey::new(ResourceKind::Equipment, eq, self.day)),
        );
        keys
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.day.and_time(self.span.end)
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }

    /// Same reservation moved to `proposal`'s day and span.
    pub fn moved_to(&self, proposal: Proposal) -> Reservation {
        Reservation {
            day: proposal.day,
            span: proposal.span,
            proposal: None,
            ..self.clone()
        }
    }
}

/// An indexed slot. Only reservations that currently hold their slot are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub reservation_id: Ulid,
    pub span: Span,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct DaySlots {
    pub key: DayKey,
    /// Whether the day has been filled from the store yet.
    pub loaded: bool,
    /// Sorted by `span.start`.
    pub entries: Vec<SlotEntry>,
}

impl DaySlots {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            loaded: false,
            entries: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start. Replaces any entry with the same id.
    pub fn insert_entry(&mut self, entry: SlotEntry) {
        self.remove_entry(entry.reservation_id);
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, id: Ulid) -> Option<SlotEntry> {
        let pos = self.entries.iter().position(|e| e.reservation_id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &SlotEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

/// A registered bookable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub kind: ResourceKind,
    pub id: ResourceId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

/// What happened to a reservation, for the notification side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ReservationRequested,
    ReservationApproved,
    ReservationCanceled,
    ReservationPassed,
    ReservationProposed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub kind: EventKind,
    pub reservation: Reservation,
}

#[cfg(test)]
pub(crate) fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: NaiveTime, end: NaiveTime) -> SlotEntry {
        SlotEntry {
            reservation_id: Ulid::new(),
            span: Span::new(start, end),
            status: Status::Approved,
        }
    }

    fn day() -> DaySlots {
        DaySlots::new(DayKey::new(
            ResourceKind::Studio,
            1,
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        ))
    }

    #[test]
    fn span_basics() {
        let s = Span::new(hm(10, 0), hm(11, 0));
        assert_eq!(s.duration(), TimeDelta::hours(1));
        assert!(s.contains_instant(hm(10, 0)));
        assert!(s.contains_instant(hm(10, 59)));
        assert!(!s.contains_instant(hm(11, 0))); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(hm(10, 0), hm(11, 0));
        let b = Span::new(hm(10, 30), hm(11, 30));
        let c = Span::new(hm(11, 0), hm(12, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_try_new_rejects_empty_and_inverted() {
        assert!(matches!(
            Span::try_new(hm(10, 0), hm(10, 0)),
            Err(ValidationError::EmptySpan { .. })
        ));
        assert!(Span::try_new(hm(11, 0), hm(10, 0)).is_err());
        assert!(Span::try_new(hm(10, 0), hm(10, 1)).is_ok());
    }

    #[test]
    fn resource_kind_parse() {
        assert_eq!("Studio".parse::<ResourceKind>().unwrap(), ResourceKind::Studio);
        assert_eq!(" cowork ".parse::<ResourceKind>().unwrap(), ResourceKind::Cowork);
        assert!("room".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn entries_stay_sorted() {
        let mut d = day();
        d.insert_entry(entry(hm(14, 0), hm(15, 0)));
        d.insert_entry(entry(hm(9, 0), hm(10, 0)));
        d.insert_entry(entry(hm(11, 0), hm(12, 0)));
        let starts: Vec<_> = d.entries.iter().map(|e| e.span.start).collect();
        assert_eq!(starts, vec![hm(9, 0), hm(11, 0), hm(14, 0)]);
    }

    #[test]
    fn reinserting_same_id_replaces() {
        let mut d = day();
        let mut e = entry(hm(9, 0), hm(10, 0));
        d.insert_entry(e);
        e.span = Span::new(hm(13, 0), hm(14, 0));
        d.insert_entry(e);
        assert_eq!(d.entries.len(), 1);
        assert_eq!(d.entries[0].span.start, hm(13, 0));
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut d = day();
        let a = entry(hm(8, 0), hm(9, 0));
        let b = entry(hm(9, 0), hm(10, 0));
        let c = entry(hm(10, 0), hm(11, 0));
        for e in [a, b, c] {
            d.insert_entry(e);
        }
        assert_eq!(d.remove_entry(b.reservation_id), Some(b));
        assert_eq!(d.entries, vec![a, c]);
        assert!(d.remove_entry(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut d = day();
        d.insert_entry(entry(hm(8, 0), hm(9, 0)));
        let hit = entry(hm(9, 30), hm(10, 30));
        d.insert_entry(hit);
        d.insert_entry(entry(hm(12, 0), hm(13, 0)));

        let hits: Vec<_> = d.overlapping(&Span::new(hm(10, 0), hm(12, 0))).collect();
        assert_eq!(hits, vec![&hit]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut d = day();
        d.insert_entry(entry(hm(9, 0), hm(10, 0)));
        d.insert_entry(entry(hm(11, 0), hm(12, 0)));
        assert_eq!(d.overlapping(&Span::new(hm(10, 0), hm(11, 0))).count(), 0);
    }

    #[test]
    fn day_keys_include_equipment() {
        let r = Reservation {
            id: Ulid::new(),
            kind: ResourceKind::Studio,
            resource_id: 7,
            day: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            span: Span::new(hm(10, 0), hm(11, 0)),
            user_id: 1,
            status: Status::Pending,
            created_at: Utc::now(),
            equipment: vec![3, 4],
            team: Vec::new(),
            proposal: None,
            note: None,
            version: 0,
        };
        let keys = r.day_keys();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], r.primary_key());
        assert_eq!(keys[1], DayKey::new(ResourceKind::Equipment, 3, r.day));
        assert_eq!(r.ends_at(), r.day.and_time(hm(11, 0)));
    }

    #[test]
    fn reservation_bincode_roundtrip() {
        let r = Reservation {
            id: Ulid::new(),
            kind: ResourceKind::Cowork,
            resource_id: 2,
            day: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            span: Span::new(hm(9, 0), hm(17, 0)),
            user_id: 42,
            status: Status::Approved,
            created_at: Utc::now(),
            equipment: Vec::new(),
            team: vec![5, 6],
            proposal: None,
            note: Some("quiet corner".into()),
            version: 3,
        };
        let bytes = bincode::serialize(&r).unwrap();
        let decoded: Reservation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(r, decoded);
    }
}
