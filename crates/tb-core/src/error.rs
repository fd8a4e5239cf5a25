//! Error type shared by the core.
//!
//! None of these are fatal. Storage failures are recovered by keeping the
//! in-memory snapshot, malformed records are skipped, and the rest are
//! rejections of the user action that triggered them.

/// Errors raised by the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Invalid domain '{input}': {reason}")]
    InvalidDomainInput { input: String, reason: &'static str },
    #[error("Malformed stored record #{index}: {reason}")]
    MalformedStoredRecord { index: usize, reason: String },
    #[error("Time limit must be at least one minute, got {0}")]
    InvalidTimeLimit(u32),
    #[error("'{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("'{0}' is not registered")]
    NotRegistered(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that reject a user action, as opposed to
    /// infrastructure failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidDomainInput { .. }
                | Error::InvalidTimeLimit(_)
                | Error::AlreadyRegistered(_)
                | Error::NotRegistered(_)
        )
    }
}
