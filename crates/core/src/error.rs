//! Error types for the Promptloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Storage failures get their own bounded-context error so that backends
//! never leak driver types into the domain.

use thiserror::Error;

/// The top-level error type for all Promptloom operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced record does not exist (or is inactive and therefore
    /// not addressable).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A record exists but is in a state the operation cannot accept.
    #[error("{entity} '{id}' is in an invalid state: {reason}")]
    InvalidState {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// Input rejected before any write occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Stored data is inconsistent with itself (e.g. two primary segments).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Composition cannot proceed because a required input is missing.
    #[error("Caller {caller_id}'s domain is not ready: {reason}")]
    DomainNotReady { caller_id: String, reason: String },

    /// A concurrent writer won the race and retries were exhausted.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        entity: &'static str,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::DomainNotReady { .. } => "domain_not_ready",
            Self::Conflict(_) => "conflict",
            Self::Timeout { .. } => "timeout",
            Self::Store(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The optimistic precondition of a write no longer holds.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be decoded into its domain type.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
