//! Backend interface
//!
//! The backend computes previews, serves pages of provided services under a
//! cache handle and persists settlements. The reconciler only ever talks to
//! it through [`SettlementBackend`].

use crate::{
    filters::PreviewRequest,
    rules::PlanRuleSet,
    types::*,
    Result,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Preview payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    /// Handle for the whole preview
    pub settlement_key: SettlementKey,

    /// One entry per agreement
    pub agreements: Vec<AgreementBaseline>,
}

impl PreviewResponse {
    /// Billable services across all agreements
    pub fn total_protocols(&self) -> u64 {
        self.agreements.iter().map(|a| a.protocols).sum()
    }
}

/// Settlement creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSettlementRequest {
    /// Insurer being settled
    pub insurer_id: InsurerId,

    /// First day of the period
    pub period_start: NaiveDate,

    /// Last day of the period
    pub period_end: NaiveDate,

    /// Computation mode
    pub settlement_type: SettlementType,

    /// Union of excluded service IDs across all agreements, ascending
    pub excluded_provided_services_ids: Vec<ServiceId>,

    /// Rule sets (SPECIAL only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_rules: Option<Vec<PlanRuleSet>>,

    /// Preview this settlement was derived from
    pub settlement_key: SettlementKey,
}

/// Settlement backend
#[async_trait]
pub trait SettlementBackend: Send + Sync {
    /// Compute a preview for the given filters
    async fn preview_settlement(&self, request: &PreviewRequest) -> Result<PreviewResponse>;

    /// Fetch one page of rows under a handle
    async fn fetch_page(
        &self,
        handle: &CacheHandle,
        page_index: u32,
    ) -> Result<Vec<ProvidedServiceRow>>;

    /// Persist a settlement
    async fn create_settlement(&self, request: &CreateSettlementRequest) -> Result<SettlementId>;

    /// Backend name, for logs
    fn name(&self) -> &str;
}
