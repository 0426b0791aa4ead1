//! Error types for the usage ledger.

use thiserror::Error;

/// Errors surfaced by the ledger store, quota policy, and accountant.
///
/// None of these are retried internally. `StoreUnavailable` in particular is
/// handed back to the caller unchanged so it can decide between failing open
/// and failing closed.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The persistence backend could not be reached, failed, or timed out.
    #[error("usage store unavailable: {0}")]
    StoreUnavailable(String),

    /// Consumption of zero units was reported.
    #[error("invalid usage delta {0}: consumption must be at least 1 unit")]
    InvalidDelta(u64),

    /// An empty or whitespace-only subject identifier was supplied.
    #[error("invalid subject: identifier must not be empty")]
    InvalidSubject,

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Returns `true` for storage outages, the only variant a caller may
    /// reasonably retry with backoff.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, LedgerError::StoreUnavailable(_))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::StoreUnavailable(format!("corrupt usage data: {e}"))
    }
}

#[cfg(feature = "store-sqlite")]
impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::StoreUnavailable(format!("sqlite error: {e}"))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            LedgerError::InvalidSubject.to_string(),
            "invalid subject: identifier must not be empty"
        );
        assert!(LedgerError::InvalidDelta(0).to_string().contains("at least 1"));
        assert!(LedgerError::StoreUnavailable("down".into())
            .to_string()
            .contains("down"));
    }

    #[test]
    fn test_io_error_maps_to_store_unavailable() {
        let err: LedgerError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(!LedgerError::InvalidSubject.is_store_unavailable());
        assert!(!LedgerError::InvalidDelta(0).is_store_unavailable());
        assert!(!LedgerError::Config("bad".into()).is_store_unavailable());
    }
}
