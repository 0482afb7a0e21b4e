//! Error types for the trusted group coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger API error at {endpoint}: {message}")]
    Ledger { endpoint: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited by ledger API at {endpoint}")]
    RateLimited { endpoint: String },

    #[error("Invalid receivers threshold {threshold}/{receivers}")]
    InvalidThreshold { threshold: i64, receivers: usize },

    #[error("Invalid amount {0}")]
    InvalidAmount(String),

    #[error("Invalid receiver {0}")]
    InvalidReceiver(String),

    #[error("Invalid trace id {0}")]
    InvalidTraceId(String),

    #[error("Memo too large: {size} bytes, limit {limit}")]
    MemoTooLarge { size: usize, limit: usize },

    #[error("Insufficient funds for asset {asset_id}: have {have}, need {need}")]
    InsufficientFunds {
        asset_id: String,
        have: String,
        need: String,
    },

    #[error("No available collectible carrier output for {trace_id}")]
    NoCollectibleCarrier { trace_id: String },

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Corrupt persisted payload: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invariant violation: {0}")]
    Fatal(String),
}

/// How the processing loops must react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retried after a fixed sleep, never surfaced past the loop
    Transient,
    /// Returned to the caller, no local state mutated
    Validation,
    /// Process must stop
    Fatal,
}

impl GroupError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GroupError::Database(_)
            | GroupError::Ledger { .. }
            | GroupError::Timeout { .. }
            | GroupError::RateLimited { .. }
            | GroupError::Server(_) => ErrorCategory::Transient,
            GroupError::Config(_)
            | GroupError::InvalidThreshold { .. }
            | GroupError::InvalidAmount(_)
            | GroupError::InvalidReceiver(_)
            | GroupError::InvalidTraceId(_)
            | GroupError::MemoTooLarge { .. }
            | GroupError::InsufficientFunds { .. }
            | GroupError::NoCollectibleCarrier { .. } => ErrorCategory::Validation,
            GroupError::Codec(_) | GroupError::Fatal(_) => ErrorCategory::Fatal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Check if error must terminate the process
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }

    pub fn ledger(endpoint: impl Into<String>, message: impl ToString) -> Self {
        GroupError::Ledger {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        GroupError::Fatal(message.into())
    }
}

/// Result type for coordinator operations
pub type GroupResult<T> = Result<T, GroupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(GroupError::ledger("/outputs", "connection reset").is_retryable());
        assert!(GroupError::fatal("index row missing").is_fatal());

        let err = GroupError::InsufficientFunds {
            asset_id: "x".to_string(),
            have: "10".to_string(),
            need: "100".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }
}
