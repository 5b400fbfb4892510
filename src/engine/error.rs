use ulid::Ulid;

use crate::model::BookingSummary;

#[derive(Debug)]
pub enum EngineError {
    /// Missing or malformed input; the caller can fix and resubmit.
    Validation(String),
    /// The requested window is held by another booking.
    Conflict(BookingSummary),
    NotFound(Ulid),
    UnknownTenant(String),
    /// The booking belongs to another tenant.
    Forbidden(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
    /// Storage failure, already logged; details are not exposed.
    Internal,
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid booking: {msg}"),
            EngineError::Conflict(summary) => {
                let json = serde_json::to_string(summary).map_err(|_| std::fmt::Error)?;
                write!(f, "time slot unavailable: {json}")
            }
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::UnknownTenant(t) => write!(f, "unknown or inactive tenant: {t}"),
            EngineError::Forbidden(id) => write!(f, "booking {id} belongs to another tenant"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal => write!(f, "internal storage error"),
        }
    }
}

impl std::error::Error for EngineError {}
