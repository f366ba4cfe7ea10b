/// Upper bound on a schedule's capacity.
pub const MAX_TOTAL_SLOTS: u32 = 999;
/// Widest date range a single batch schedule creation may cover.
pub const MAX_BATCH_DAYS: i64 = 90;
pub const MAX_SYMPTOM_LEN: usize = 512;
pub const MIN_CANCEL_REASON_LEN: usize = 2;
pub const MAX_CANCEL_REASON_LEN: usize = 256;
pub const MAX_PAGE_SIZE: usize = 100;

/// Lifetime of an idempotency token.
pub const TOKEN_TTL_SECS: u64 = 300;

pub const CHECKIN_EARLY_MINUTES: i64 = 30;
pub const CHECKIN_LATE_MINUTES: i64 = 15;

/// Random digits appended to the timestamp part of an appointment number.
pub const APPOINTMENT_NO_SUFFIX_DIGITS: u32 = 6;
/// Attempts at drawing an unused appointment number before giving up.
pub const APPOINTMENT_NO_ATTEMPTS: usize = 8;
