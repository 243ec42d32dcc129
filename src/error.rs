//! Error taxonomy shared by every core component.
//!
//! Transient classes (`Network`, `Timeout`, `Server`, `RateLimited`) are the
//! only ones the retry executor will ever retry, and only when the matching
//! toggle in [`RetryConfig`](crate::config::RetryConfig) is set. Everything
//! else propagates unchanged.
use thiserror::Error;

/// Errors surfaced by the pool, retry executor, coordinator and registry.
///
/// The type is `Clone` because a single terminal outcome of a coalesced
/// request is handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    /// Caller contract violation (used before initialization, unknown handle, ...)
    #[error("Usage error: {0}")]
    Usage(String),

    /// Connection could not be established or was reset
    #[error("Network error: {0}")]
    Network(String),

    /// The remote call did not complete in time
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The dependency answered with a 5xx status
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The dependency answered with 429
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Any other non-success HTTP status
    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// The dependency's circuit breaker rejected the call without attempting it
    #[error("Circuit breaker is open for dependency '{dependency}' (retry in {retry_in_ms}ms)")]
    CircuitOpen { dependency: String, retry_in_ms: u64 },

    /// A registered factory failed to build its dependency
    #[error("Failed to create dependency '{dependency}': {message}")]
    DependencyCreation { dependency: String, message: String },

    /// An in-flight request expired before anyone completed it
    #[error("In-flight request {fingerprint} expired before completion")]
    DuplicateRequestTimeout { fingerprint: String },

    /// Non-transient failure reported by a dependency adapter
    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Result type for core operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Build the matching variant for an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => GatewayError::RateLimited {
                message,
                retry_after_ms: None,
            },
            500..=599 => GatewayError::Server { status, message },
            _ => GatewayError::Status { status, message },
        }
    }

    /// Stable tag used for per-dependency error tallies and metric labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Usage(_) => "usage",
            GatewayError::Network(_) => "network",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Server { .. } => "server",
            GatewayError::RateLimited { .. } => "rate_limit",
            GatewayError::Status { .. } => "status",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::DependencyCreation { .. } => "dependency_creation",
            GatewayError::DuplicateRequestTimeout { .. } => "duplicate_request_timeout",
            GatewayError::Operation(_) => "operation",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            GatewayError::Server { status, .. } | GatewayError::Status { status, .. } => {
                Some(*status)
            }
            GatewayError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether the error belongs to one of the transient classes.
    ///
    /// This ignores retry configuration; see `RetryConfig::is_retryable`.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_)
                | GatewayError::Timeout(_)
                | GatewayError::Server { .. }
                | GatewayError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::from_status(status.as_u16(), err.to_string())
        } else if err.is_connect() || err.is_request() {
            GatewayError::Network(err.to_string())
        } else if err.is_decode() || err.is_body() {
            GatewayError::Operation(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}
