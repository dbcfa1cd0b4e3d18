use crate::model::Ms;

/// Hard limits on inputs. Anything above these is rejected before it touches the store.
pub const MAX_PARTY_SIZE: u32 = 100;
pub const MAX_TABLES_PER_HOLD: usize = 8;
pub const MAX_TABLES_PER_RESTAURANT: usize = 512;
pub const MAX_ZONES_PER_RESTAURANT: usize = 64;
pub const MAX_RESTAURANTS: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_FIELD_LEN: usize = 320;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single hold or assignment never covers more than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;
pub const MAX_HOLD_TTL_MS: Ms = 30 * 60_000;

pub const MAX_OUTBOX_BATCH: usize = 1_000;
pub const MAX_SWEEP_BATCH: usize = 10_000;
pub const MAX_ALTERNATIVES: usize = 5;
