use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// First holding reservation on the room that overlaps `span`, ignoring `exclude`.
///
/// Takes `&RoomState`, which callers only get through the room lock, so the
/// answer stays true until that lock is released.
pub fn find_conflict(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(span)
        .filter(|r| r.status.holds_room())
        .find(|r| Some(r.id) != exclude)
        .map(|r| r.id)
}

pub fn has_conflict(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, span, exclude).is_some()
}

pub(crate) fn validate_timestamps(start: Ms, end: Ms) -> Result<(), EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}
