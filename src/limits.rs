/// Equipment units that may ride along on one reservation.
pub const MAX_EQUIPMENT_PER_RESERVATION: usize = 32;

/// Team members on one reservation, owner excluded.
pub const MAX_TEAM_SIZE: usize = 64;

/// Free-text note attached to a reservation.
pub const MAX_NOTE_LEN: usize = 2_000;

/// Approved reservations indexed on a single resource-day.
pub const MAX_ENTRIES_PER_DAY: usize = 1_440;

/// Passed-sweep candidates processed concurrently.
pub const SWEEP_CONCURRENCY: usize = 16;
