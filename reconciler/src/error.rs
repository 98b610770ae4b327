//! Error types for the settlement reconciler

use crate::types::{CacheHandle, InsurerId, ServiceId};
use thiserror::Error;

/// Result type for reconciler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler errors
#[derive(Error, Debug)]
pub enum Error {
    /// A required preview filter is missing
    #[error("Missing filter: {0}")]
    MissingFilter(&'static str),

    /// Settlement period is inverted
    #[error("Invalid period: {start} is after {end}")]
    InvalidPeriod {
        /// Period start
        start: chrono::NaiveDate,
        /// Period end
        end: chrono::NaiveDate,
    },

    /// Special rule set failed validation
    #[error("Invalid special rules: {0}")]
    InvalidRules(String),

    /// Insurer has no plan eligible for the period
    #[error("Insurer {insurer_id} has no active plans for the period")]
    NoActivePlans {
        /// Insurer ID
        insurer_id: InsurerId,
    },

    /// Backend unreachable or request timed out
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-success status
    #[error("Backend error {status}: {message}")]
    Backend {
        /// HTTP-like status code
        status: u16,
        /// Error message
        message: String,
    },

    /// Operation requires a draft and none is active
    #[error("No settlement draft is active")]
    NoDraft,

    /// Handle is not part of the current draft
    #[error("Unknown cache handle: {0}")]
    UnknownHandle(CacheHandle),

    /// Page index beyond the agreement's page count
    #[error("Page {page} out of range for {handle} ({page_count} pages)")]
    PageOutOfRange {
        /// Cache handle
        handle: CacheHandle,
        /// Requested page
        page: u32,
        /// Pages available
        page_count: u32,
    },

    /// Exclusion requested on a row that was never rendered
    #[error("Service {id} is not on a loaded page of {handle}")]
    RowNotCached {
        /// Cache handle
        handle: CacheHandle,
        /// Service ID
        id: ServiceId,
    },

    /// State machine rejected a transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure taxonomy surfaced to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Insurer has no eligible plans; shown as a warning
    NoActivePlans,
    /// Filters or rules rejected before any request
    Validation,
    /// Backend unreachable or answered with an error status
    Transport,
    /// Operation not allowed in the current state
    State,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NoActivePlans => write!(f, "no-active-plans"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::State => write!(f, "state"),
        }
    }
}

impl FailureKind {
    /// Whether the operator can act on it without the backend recovering
    pub fn is_warning(&self) -> bool {
        !matches!(self, FailureKind::Transport)
    }
}

impl Error {
    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Backend { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Classify into the operator-facing taxonomy
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::NoActivePlans { .. } => FailureKind::NoActivePlans,
            Error::MissingFilter(_)
            | Error::InvalidPeriod { .. }
            | Error::InvalidRules(_)
            | Error::Config(_) => FailureKind::Validation,
            Error::NoDraft
            | Error::UnknownHandle(_)
            | Error::PageOutOfRange { .. }
            | Error::RowNotCached { .. }
            | Error::InvalidTransition { .. } => FailureKind::State,
            Error::Transport(_)
            | Error::Backend { .. }
            | Error::Serialization(_)
            | Error::Io(_) => FailureKind::Transport,
        }
    }
}
