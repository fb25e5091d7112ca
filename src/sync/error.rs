//! Sync error taxonomy
//!
//! Record-level errors are caught, logged to the sync error log and the batch
//! continues. Connection-level errors abort the run with a single message.

use crate::db::DbError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Access token expired and could not be refreshed: {0}")]
    TokenExpired(String),

    #[error("Accounting connection was revoked ({0}). Reconnect the accounting integration to resume sync.")]
    TokenRevoked(String),

    #[error("Rate limited by the accounting API, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Network error: {0}")]
    NetworkTransient(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    #[error("Duplicate entity detected: {0}")]
    DuplicateEntityDetected(String),

    #[error("No active accounting connection")]
    NoActiveConnection,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Errors that make every remaining record in the run fail the same way
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SyncError::TokenRevoked(_) | SyncError::TokenExpired(_) | SyncError::NoActiveConnection
        )
    }

    /// Worth another attempt with the same input
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. }
                | SyncError::NetworkTransient(_)
                | SyncError::Timeout(_)
                | SyncError::TokenExpired(_)
        )
    }

    /// Stable machine-readable code stored in `sync_logs.error_details`
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::TokenExpired(_) => "token_expired",
            SyncError::TokenRevoked(_) => "token_revoked",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::NetworkTransient(_) => "network_transient",
            SyncError::ValidationError(_) => "validation_error",
            SyncError::ConflictDetected(_) => "conflict_detected",
            SyncError::DuplicateEntityDetected(_) => "duplicate_entity_detected",
            SyncError::NoActiveConnection => "no_active_connection",
            SyncError::Timeout(_) => "timeout",
            SyncError::Database(_) => "database",
        }
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(SyncError::TokenRevoked("invalid_grant".into()).is_connection_level());
        assert!(SyncError::NoActiveConnection.is_connection_level());
        assert!(!SyncError::ValidationError("missing name".into()).is_connection_level());
        assert!(!SyncError::RateLimited { retry_after_secs: 5 }.is_connection_level());
    }

    #[test]
    fn test_revoked_message_is_actionable() {
        let message = SyncError::TokenRevoked("invalid_grant".into()).to_string();
        assert!(message.contains("Reconnect"));
    }
}
