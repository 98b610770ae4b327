//! Core types for the settlement reconciler

use crate::rules::PlanRuleSet;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Insurer identifier
    InsurerId
);
integer_id!(
    /// Coverage plan identifier
    PlanId
);
integer_id!(
    /// Provided service identifier (server-assigned, opaque)
    ServiceId
);
integer_id!(
    /// Persisted settlement identifier
    SettlementId
);

/// Server-issued handle for one agreement's paginated result set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheHandle(String);

impl CacheHandle {
    /// Create new handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued handle for an entire settlement preview
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementKey(String);

impl SettlementKey {
    /// Create new key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Billing status of a provided service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Recorded, not yet authorized
    Pending,
    /// Authorized by the insurer
    Authorized,
    /// Ready to be billed
    Billable,
    /// Already part of a settlement
    Billed,
    /// Rejected by the insurer
    Rejected,
    /// Any status this client does not know about
    #[serde(other)]
    Unknown,
}

/// One billable service as returned by a page fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidedServiceRow {
    /// Service ID
    pub id: ServiceId,

    /// Date the service was provided
    pub service_date: NaiveDate,

    /// Where the service originated (lab, branch, requesting physician)
    pub origin_label: String,

    /// Number of analyses performed
    pub analysis_count: u32,

    /// Amount covered by the insurer
    pub covered_amount: Decimal,

    /// Amount paid by the patient
    pub copayment_amount: Decimal,

    /// Billing status
    pub status: ServiceStatus,

    /// View projection of exclusion membership, never taken from the wire
    #[serde(skip_deserializing)]
    pub excluded: bool,
}

impl ProvidedServiceRow {
    /// Billable amount contributed to a settlement
    pub fn net_amount(&self) -> Decimal {
        self.covered_amount - self.copayment_amount
    }
}

/// Settlement computation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementType {
    /// Amounts as recorded on each service
    Simple,
    /// Amounts replaced by per-plan quantity rules
    Special,
}

impl std::fmt::Display for SettlementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementType::Simple => write!(f, "SIMPLE"),
            SettlementType::Special => write!(f, "SPECIAL"),
        }
    }
}

/// Per-agreement figures reported by the preview call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementBaseline {
    /// Plan name
    pub plan_name: String,

    /// Human label for the agreement's validity window
    pub coverage_period_label: String,

    /// Handle for this agreement's pages
    #[serde(rename = "baseKey")]
    pub cache_handle: CacheHandle,

    /// Pages available under the handle
    pub page_count: u32,

    /// Billable services in the whole result set
    pub protocols: u64,

    /// Agreement-level fee, informational
    pub fee: Decimal,

    /// Σ net amount over every service in the result set
    pub subtotal: Decimal,
}

/// Derived per-agreement row of a draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementAggregate {
    /// Plan name
    pub plan_name: String,

    /// Agreement validity label
    pub coverage_period_label: String,

    /// Handle for this agreement's pages
    pub cache_handle: CacheHandle,

    /// Pages available under the handle
    pub page_count: u32,

    /// Pages currently cached
    pub fetched_pages: u32,

    /// Services still included
    pub included_count: u64,

    /// Services excluded by the operator
    pub excluded_count: usize,

    /// Net amount of included services
    pub subtotal: Decimal,

    /// Agreement-level fee, informational
    pub fee: Decimal,
}

/// Non-fatal conditions attached to a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DraftWarning {
    /// Preview succeeded with zero billable services
    EmptyResult,
}

/// Draft-level totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftTotals {
    /// Services included across all agreements
    pub total_included_count: u64,

    /// Net amount across all agreements
    pub total_amount: Decimal,

    /// Services excluded across all agreements
    pub total_excluded_count: usize,
}

/// Snapshot of a settlement preview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementDraft {
    /// Local identity of this draft
    pub draft_id: Uuid,

    /// Insurer being settled
    pub insurer_id: InsurerId,

    /// First day of the period
    pub period_start: NaiveDate,

    /// Last day of the period
    pub period_end: NaiveDate,

    /// Computation mode
    pub settlement_type: SettlementType,

    /// Rule sets (empty unless SPECIAL)
    pub special_rules: Vec<PlanRuleSet>,

    /// One row per agreement, in preview order
    pub aggregates: Vec<AgreementAggregate>,

    /// Handle correlating the create request with this preview
    pub settlement_key: SettlementKey,

    /// Services included across all agreements
    pub total_included_count: u64,

    /// Net amount across all agreements
    pub total_amount: Decimal,

    /// Non-fatal conditions
    pub warnings: Vec<DraftWarning>,

    /// When the preview was received
    pub created_at: DateTime<Utc>,
}

impl SettlementDraft {
    /// Whether the preview produced nothing to bill
    pub fn is_empty(&self) -> bool {
        self.warnings.contains(&DraftWarning::EmptyResult)
    }

    /// Totals view of this draft
    pub fn totals(&self) -> DraftTotals {
        DraftTotals {
            total_included_count: self.total_included_count,
            total_amount: self.total_amount,
            total_excluded_count: self.aggregates.iter().map(|a| a.excluded_count).sum(),
        }
    }
}
