use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Reject malformed or past-dated intervals before any lock is taken.
pub fn validate_interval(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if span.start < now {
        return Err(EngineError::InvalidInterval("start is in the past"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::InvalidInterval("booking longer than 31 days"));
    }
    Ok(())
}

/// Earliest active booking on this vehicle that strictly overlaps `span`,
/// skipping `exclude` (the booking being rescheduled).
pub fn find_conflict<'a>(
    vs: &'a VehicleState,
    span: &Span,
    exclude: Option<BookingId>,
) -> Option<&'a Booking> {
    vs.overlapping(span)
        .find(|b| b.status.is_active() && Some(b.id) != exclude)
}

pub fn has_conflict(vs: &VehicleState, span: &Span, exclude: Option<BookingId>) -> bool {
    find_conflict(vs, span, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    vs: &VehicleState,
    span: &Span,
    exclude: Option<BookingId>,
) -> Result<(), EngineError> {
    match find_conflict(vs, span, exclude) {
        Some(existing) => Err(EngineError::BookingConflict {
            booking_id: existing.id,
            span: existing.span,
        }),
        None => Ok(()),
    }
}
