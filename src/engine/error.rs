use ulid::Ulid;

use crate::model::BookingStatus;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or inconsistent request. Never retried.
    Validation,
    /// Contention or drift. The coordinator may retry with another candidate.
    Conflict,
    /// Missing entity.
    NotFound,
    /// Storage failure.
    Repository,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("hold not found: {0}")]
    HoldNotFound(Ulid),
    #[error("hold {0} has expired")]
    HoldExpired(Ulid),
    #[error("hold {0} has no tables")]
    HoldEmpty(Ulid),
    #[error("hold {hold_id} is linked to booking {held_for}, not {requested}")]
    HoldBookingMismatch {
        hold_id: Ulid,
        held_for: Ulid,
        requested: Ulid,
    },
    #[error("hold {hold_id} belongs to restaurant {hold_restaurant}, booking to {booking_restaurant}")]
    HoldRestaurantMismatch {
        hold_id: Ulid,
        hold_restaurant: Ulid,
        booking_restaurant: Ulid,
    },
    #[error("hold {0} covers a different table set than requested")]
    HoldTableMismatch(Ulid),
    #[error("hold {hold_id} is missing {missing:?}; regenerate it before confirming")]
    HoldMetadataIncomplete {
        hold_id: Ulid,
        missing: Vec<&'static str>,
    },
    #[error("venue policy changed since the hold was quoted (v{quoted} -> v{current})")]
    PolicyDrift { quoted: u32, current: u32 },
    #[error("table {table_id} is already claimed by {with}")]
    Conflict { table_id: Ulid, with: Ulid },
    #[error("assignment rejected: {0}")]
    AssignmentValidation(String),
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("booking already exists: {0}")]
    BookingExists(Ulid),
    #[error("unknown table: {0}")]
    UnknownTable(Ulid),
    #[error("cannot move booking from {from} to {to}")]
    TransitionNotAllowed {
        from: BookingStatus,
        to: BookingStatus,
        allowed: Vec<BookingStatus>,
    },
    #[error("booking version is {actual}, expected {expected}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::HoldNotFound(_) => "HOLD_NOT_FOUND",
            EngineError::HoldExpired(_) => "HOLD_EXPIRED",
            EngineError::HoldEmpty(_) => "HOLD_EMPTY",
            EngineError::HoldBookingMismatch { .. } => "HOLD_BOOKING_MISMATCH",
            EngineError::HoldRestaurantMismatch { .. } => "HOLD_RESTAURANT_MISMATCH",
            EngineError::HoldTableMismatch(_) => "HOLD_TABLE_MISMATCH",
            EngineError::HoldMetadataIncomplete { .. } => "HOLD_METADATA_INCOMPLETE",
            EngineError::PolicyDrift { .. } => "POLICY_DRIFT",
            EngineError::Conflict { .. } => "HOLD_CONFLICT",
            EngineError::AssignmentValidation(_) => "ASSIGNMENT_VALIDATION",
            EngineError::BookingNotFound(_) => "BOOKING_NOT_FOUND",
            EngineError::BookingExists(_) => "BOOKING_EXISTS",
            EngineError::UnknownTable(_) => "UNKNOWN_TABLE",
            EngineError::TransitionNotAllowed { .. } => "TRANSITION_NOT_ALLOWED",
            EngineError::VersionConflict { .. } => "VERSION_CONFLICT",
            EngineError::InvalidRequest(_) => "INVALID_REQUEST",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "REPOSITORY_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Conflict { .. }
            | EngineError::PolicyDrift { .. }
            | EngineError::HoldExpired(_)
            | EngineError::BookingExists(_)
            | EngineError::VersionConflict { .. } => ErrorClass::Conflict,
            EngineError::HoldNotFound(_) | EngineError::BookingNotFound(_) => ErrorClass::NotFound,
            EngineError::WalError(_) => ErrorClass::Repository,
            EngineError::HoldEmpty(_)
            | EngineError::HoldBookingMismatch { .. }
            | EngineError::HoldRestaurantMismatch { .. }
            | EngineError::HoldTableMismatch(_)
            | EngineError::HoldMetadataIncomplete { .. }
            | EngineError::AssignmentValidation(_)
            | EngineError::UnknownTable(_)
            | EngineError::TransitionNotAllowed { .. }
            | EngineError::InvalidRequest(_)
            | EngineError::LimitExceeded(_) => ErrorClass::Validation,
        }
    }
}
