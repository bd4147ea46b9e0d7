//! Error surface of the sync core.
//!
//! Recoverable trouble travels as values of this type: storage failures are
//! logged and degrade to empty data, backend listen failures become cancel
//! events, and rejected writes get rolled out of the pending-write overlay.
//! Broken internal invariants never use this type; they abort through
//! `util::hard_assert`.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseErrorCode {
    /// The caller handed the core something malformed: a bad path, or query
    /// constraints that contradict each other. Repeating the call cannot
    /// succeed.
    InvalidArgument,
    /// Unexpected state in the core or one of its collaborators.
    Internal,
    /// Durable storage or the backend cannot be reached right now; the same
    /// operation may well succeed later.
    Unavailable,
    /// A pending write was clobbered by a later set before the backend
    /// acknowledged it; its data must not be replayed.
    OverriddenBySet,
    /// The backend refused a write (rules, disconnect); the local overlay has
    /// to be rolled back.
    WriteCanceled,
}

impl DatabaseErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseErrorCode::InvalidArgument => "database/invalid-argument",
            DatabaseErrorCode::Internal => "database/internal",
            DatabaseErrorCode::Unavailable => "database/unavailable",
            DatabaseErrorCode::OverriddenBySet => "database/overridden-by-set",
            DatabaseErrorCode::WriteCanceled => "database/write-canceled",
        }
    }

    /// Whether re-submitting the same operation unchanged is worthwhile.
    pub fn retryable(self) -> bool {
        matches!(self, DatabaseErrorCode::Unavailable)
    }

    /// Whether a write that failed with this code is gone for good and must be
    /// reverted out of the pending-write overlay, rather than kept for the
    /// transport to retry.
    pub fn causes_revert(self) -> bool {
        matches!(
            self,
            DatabaseErrorCode::OverriddenBySet | DatabaseErrorCode::WriteCanceled
        )
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseError {
    code: DatabaseErrorCode,
    message: String,
}

impl DatabaseError {
    pub fn new(code: DatabaseErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> DatabaseErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    pub fn causes_revert(&self) -> bool {
        self.code.causes_revert()
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for DatabaseError {}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub fn invalid_argument(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::InvalidArgument, message)
}

pub fn unavailable(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Unavailable, message)
}

pub fn overridden_by_set(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::OverriddenBySet, message)
}

pub fn write_canceled(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::WriteCanceled, message)
}
