//! Error types for adapters

use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Adapter errors
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout
    #[error("Timeout after {seconds}s: {operation}")]
    Timeout {
        /// Timeout duration
        seconds: u64,
        /// Operation
        operation: String,
    },

    /// Billing API answered with a non-success status
    #[error("Billing API error {status_code}: {message}")]
    BillingApi {
        /// HTTP status code
        status_code: u16,
        /// Error code from the envelope, if any
        code: Option<String>,
        /// Error message
        message: String,
    },

    /// Insurer has no plans eligible for the requested period
    #[error("Insurer {insurer_id} has no active plans: {message}")]
    NoActivePlans {
        /// Insurer ID
        insurer_id: i64,
        /// Server message
        message: String,
    },

    /// Retry exhausted
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Attempts
        attempts: u32,
        /// Last error
        last_error: Box<Error>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the same request may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout { .. } => true,
            Error::BillingApi { status_code, .. } => *status_code >= 500 || *status_code == 429,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<Error> for reconciler::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NoActivePlans { insurer_id, .. } => reconciler::Error::NoActivePlans {
                insurer_id: reconciler::InsurerId(insurer_id),
            },
            Error::BillingApi {
                status_code,
                message,
                ..
            } => reconciler::Error::Backend {
                status: status_code,
                message,
            },
            Error::RetryExhausted { last_error, .. } => (*last_error).into(),
            Error::Config(msg) => reconciler::Error::Config(msg),
            Error::Json(e) => reconciler::Error::Serialization(e),
            other => reconciler::Error::Transport(other.to_string()),
        }
    }
}
