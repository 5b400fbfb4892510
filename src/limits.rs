/// Maximum number of tenant engines loaded at once.
pub const MAX_TENANTS: usize = 1024;

/// Maximum tenant (database) name length in bytes.
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Maximum bookings stored for one tenant on one date.
pub const MAX_BOOKINGS_PER_DAY: usize = 2048;

/// Client name, service name and master name.
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_PHONE_LEN: usize = 32;

pub const MAX_COMMENT_LEN: usize = 2048;

/// Maximum rows accepted by a single import.
pub const MAX_IMPORT_BATCH: usize = 10_000;

/// Digits required in a client phone number.
pub const MIN_PHONE_DIGITS: usize = 9;

/// Digits kept from a phone query for suffix matching.
pub const PHONE_MATCH_DIGITS: usize = 10;
