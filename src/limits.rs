use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking may not exceed 31 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_ACTIVE_BOOKINGS_PER_VEHICLE: usize = 10_000;
pub const MAX_VEHICLES: usize = 100_000;

pub const MAX_MAKE_LEN: usize = 64;
pub const MAX_MODEL_LEN: usize = 64;
pub const MAX_REGISTRATION_LEN: usize = 32;
pub const MAX_LOCATION_LEN: usize = 128;

/// Charge level is a battery percentage.
pub const MAX_CHARGE_LEVEL: u8 = 100;

/// Longest accepted command line on the TCP front.
pub const MAX_LINE_LEN: usize = 8 * 1024;
