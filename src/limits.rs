//! Hard bounds on caller input. Exceeding one is a bad request, never a panic.

use crate::model::{Ms, DAY};

pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 200;

/// Distinct participants including the applicant.
pub const MIN_PARTICIPANTS: usize = 3;
pub const MAX_PARTICIPANTS: usize = 100;

pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

pub const LEADERBOARD_LIMIT: usize = 50;
pub const MAX_USAGE_WINDOW_DAYS: u32 = 366;
pub const MAX_OVERVIEW_DAYS: u32 = 14;

/// 2000-01-01 .. 2100-01-01; anything outside is a client bug.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_BAN_DURATION_MS: Ms = 3650 * DAY;
