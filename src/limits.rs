// Hard input limits. Checked at the booking boundary and in the store.

/// Maximum writes in one `write_all_if` batch (a stay plus its reservation document).
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Maximum serialized size of a single document.
pub const MAX_DOCUMENT_BYTES: usize = 64 * 1024;

/// Longest stay accepted before pricing, regardless of policy.
pub const MAX_STAY_NIGHTS: i64 = 365;

/// Widest calendar window a single query may read.
pub const MAX_CALENDAR_WINDOW_DAYS: i64 = 731;

/// How far ahead a reservation or block may start.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 3 * 366;

pub const MAX_GUESTS: u32 = 100;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_NOTE_LEN: usize = 2_000;

/// Seasons per property.
pub const MAX_SEASONS: usize = 200;

/// Maximum concurrent connections (default, overridable via env var).
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
