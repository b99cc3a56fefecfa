//! Error types for mnemo-core
//!
//! One crate-level error enum covers the failure taxonomy: persistence,
//! serialization, configuration, resource exhaustion, breaker rejection,
//! and channel delivery. Rate-limit denials are deliberately *not* errors;
//! they are structured outcomes (see [`crate::rate_limiter::RateLimitDecision`]).

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite persistence error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Document-store collaborator error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration (malformed time string, unknown timezone, ...)
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Active timer count would exceed the hard cap
    #[error("timer capacity exceeded: {active} active, limit {limit}")]
    TimerCapacity {
        /// Timers currently registered
        active: usize,
        /// Configured maximum
        limit: usize,
    },

    /// Operation on a destroyed timer manager
    #[error("timer manager has been destroyed")]
    TimerManagerDestroyed,

    /// Circuit breaker rejected the call without invoking the operation
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen {
        /// Breaker name
        name: String,
    },

    /// Operation exceeded the breaker's request timeout
    #[error("operation timed out in circuit breaker '{name}'")]
    BreakerTimeout {
        /// Breaker name
        name: String,
    },

    /// Channel delivery failure
    #[error("channel '{channel}' delivery failed: {message}")]
    Channel {
        /// Channel name
        channel: String,
        /// Failure detail
        message: String,
    },

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is a breaker-open rejection.
    ///
    /// Callers use this to distinguish "dependency known bad, short-circuited"
    /// from a real delivery attempt that failed.
    #[must_use]
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Error::BreakerOpen { .. })
    }
}
