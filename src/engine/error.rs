use crate::model::{BookingId, BookingStatus, Span, VehicleId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed, out of range or past-dated interval. Not retried.
    InvalidInterval(&'static str),
    /// Overlaps an active booking; carries that booking's window.
    BookingConflict {
        booking_id: BookingId,
        span: Span,
    },
    VehicleNotFound(VehicleId),
    BookingNotFound(BookingId),
    AlreadyExists(VehicleId),
    IllegalTransition {
        booking_id: BookingId,
        from: BookingStatus,
        to: &'static str,
    },
    LimitExceeded(&'static str),
    /// Onboarding condition report out of range.
    InvalidCondition(&'static str),
    /// The journal rejected the commit. Nothing was applied; safe to retry.
    Storage(String),
}

impl EngineError {
    pub(crate) fn storage(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }

    /// Stable machine-readable code for the command front.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::BookingConflict { .. } => "booking_conflict",
            EngineError::VehicleNotFound(_) | EngineError::BookingNotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::InvalidCondition(_) => "invalid_condition",
            EngineError::Storage(_) => "storage_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(reason) => write!(f, "invalid interval: {reason}"),
            EngineError::BookingConflict { booking_id, span } => write!(
                f,
                "time range overlaps with booking {booking_id} from {} to {}",
                span.start, span.end
            ),
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "vehicle already exists: {id}"),
            EngineError::IllegalTransition { booking_id, from, to } => {
                write!(f, "booking {booking_id} cannot go from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InvalidCondition(msg) => write!(f, "invalid vehicle condition: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
