//! Hard limits on untrusted input.

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_MATRICULA_LEN: usize = 64;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 2048;
pub const MAX_RESOURCES_PER_ROOM: usize = 64;
pub const MAX_RESOURCE_LEN: usize = 128;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 1024;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000;
/// A single reservation may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
