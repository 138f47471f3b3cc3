/// Error types for engagement-service
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngagementError {
    /// Malformed input: missing ids, unknown enum value, out-of-range numbers
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded for {action}: {used}/{allowance} used in current period")]
    QuotaExceeded {
        action: String,
        used: u32,
        allowance: u32,
    },

    /// Transition not permitted from the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Data-access failure; retryable
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Optimistic version check failed; the caller should re-read and retry
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Computation error: {0}")]
    Computation(String),
}

impl EngagementError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::TransientStore(msg.into())
    }

    /// Whether a single-entity call may be retried after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngagementError::TransientStore(_) | EngagementError::Conflict(_)
        )
    }

    /// Short label used in metrics and run records
    pub fn kind(&self) -> &'static str {
        match self {
            EngagementError::Validation(_) => "validation",
            EngagementError::NotFound(_) => "not_found",
            EngagementError::QuotaExceeded { .. } => "quota_exceeded",
            EngagementError::InvalidState(_) => "invalid_state",
            EngagementError::TransientStore(_) => "transient_store",
            EngagementError::Conflict(_) => "conflict",
            EngagementError::Computation(_) => "computation",
        }
    }
}

impl From<sqlx::Error> for EngagementError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngagementError::NotFound("row not found".to_string()),
            other => EngagementError::TransientStore(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EngagementError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngagementError::TransientStore(format!("migration failed: {}", err))
    }
}

impl From<resilience::RetryError<EngagementError>> for EngagementError {
    fn from(err: resilience::RetryError<EngagementError>) -> Self {
        err.into_inner()
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngagementError>;
