//! Error types shared by the order store, sync engine and staff login.
//!
//! Authorization denials are deliberately absent: route guards resolve them
//! to `guards::Navigation::Redirect` values instead of failing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PosError>;

#[derive(Debug, Error)]
pub enum PosError {
    /// Malformed submission; rejected before anything is written or queued.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Local persistence failure; the operation did not take effect.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for PosError {
    fn from(e: rusqlite::Error) -> Self {
        PosError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for PosError {
    fn from(e: serde_json::Error) -> Self {
        PosError::Storage(format!("serialize: {e}"))
    }
}

/// Delivery failure talking to the admin dashboard.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("{0}")]
    Network(String),

    #[error("{message} (HTTP {status})")]
    Server { status: u16, message: String },

    /// The dashboard refused the payload (4xx other than auth/backpressure).
    #[error("Rejected by admin dashboard: {0}")]
    Rejected(String),
}

impl SyncError {
    /// Transient failures are retried with backoff; everything else still stays
    /// queued, it just is not expected to heal on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Server { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            SyncError::Rejected(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Too many failed attempts. Try again in {minutes} minute(s).")]
    LockedOut { minutes: i64 },

    #[error("{0}")]
    InvalidPinFormat(String),
}
