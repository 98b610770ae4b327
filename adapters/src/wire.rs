//! Billing API envelopes
//!
//! Bodies the HTTP backend exchanges beyond the engine's own request and
//! response types.

use reconciler::{ProvidedServiceRow, SettlementId};
use serde::{Deserialize, Serialize};

/// Error code the API uses when an insurer has no eligible plans
pub const NO_ACTIVE_PLANS: &str = "NO_ACTIVE_PLANS";

/// Error body returned with non-success statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Machine-readable code
    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl ErrorEnvelope {
    /// Parse a body, falling back to the raw text as message
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| Self {
            code: None,
            message: body.trim().to_string(),
        })
    }

    /// Whether this is the "no active plans" condition
    pub fn is_no_active_plans(&self) -> bool {
        self.code.as_deref() == Some(NO_ACTIVE_PLANS)
    }
}

/// One page of provided services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEnvelope {
    /// Zero-based page index
    pub page: u32,

    /// Rows in server order
    pub content: Vec<ProvidedServiceRow>,
}

/// Body returned by settlement creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEnvelope {
    /// Persisted settlement ID
    pub id: SettlementId,
}
