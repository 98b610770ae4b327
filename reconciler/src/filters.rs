//! Preview filters
//!
//! The operator picks an insurer, a period, a settlement type and (for
//! SPECIAL) rule sets. Nothing is sent to the backend until the filters
//! validate into a [`PreviewRequest`].

use crate::{
    rules::{validate_rule_sets, PlanRuleSet},
    types::{InsurerId, SettlementType},
    Error, Result,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Filter selection as entered by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementFilters {
    /// Insurer to settle
    pub insurer_id: Option<InsurerId>,

    /// First day of the period
    pub period_start: Option<NaiveDate>,

    /// Last day of the period
    pub period_end: Option<NaiveDate>,

    /// Computation mode
    pub settlement_type: SettlementType,

    /// Rule sets, only meaningful for SPECIAL
    pub special_rules: Vec<PlanRuleSet>,
}

impl Default for SettlementFilters {
    fn default() -> Self {
        Self {
            insurer_id: None,
            period_start: None,
            period_end: None,
            settlement_type: SettlementType::Simple,
            special_rules: Vec::new(),
        }
    }
}

impl SettlementFilters {
    /// Simple settlement filters
    pub fn simple(insurer_id: InsurerId, period_start: NaiveDate, period_end: NaiveDate) -> Self {
        Self {
            insurer_id: Some(insurer_id),
            period_start: Some(period_start),
            period_end: Some(period_end),
            ..Default::default()
        }
    }

    /// Special settlement filters
    pub fn special(
        insurer_id: InsurerId,
        period_start: NaiveDate,
        period_end: NaiveDate,
        special_rules: Vec<PlanRuleSet>,
    ) -> Self {
        Self {
            insurer_id: Some(insurer_id),
            period_start: Some(period_start),
            period_end: Some(period_end),
            settlement_type: SettlementType::Special,
            special_rules,
        }
    }

    /// Whether insurer and period are both selected
    pub fn is_complete(&self) -> bool {
        self.insurer_id.is_some() && self.period_start.is_some() && self.period_end.is_some()
    }

    /// Validate into a request the backend can accept
    pub fn validate(&self) -> Result<PreviewRequest> {
        let insurer_id = self.insurer_id.ok_or(Error::MissingFilter("insurer"))?;
        let period_start = self.period_start.ok_or(Error::MissingFilter("period start"))?;
        let period_end = self.period_end.ok_or(Error::MissingFilter("period end"))?;

        if period_start > period_end {
            return Err(Error::InvalidPeriod {
                start: period_start,
                end: period_end,
            });
        }

        let special_rules = match self.settlement_type {
            SettlementType::Simple => None,
            SettlementType::Special => {
                if self.special_rules.is_empty() {
                    return Err(Error::InvalidRules(
                        "special settlement requires at least one rule set".to_string(),
                    ));
                }
                validate_rule_sets(&self.special_rules)?;
                Some(self.special_rules.clone())
            }
        };

        Ok(PreviewRequest {
            insurer_id,
            period_start,
            period_end,
            settlement_type: self.settlement_type,
            special_rules,
        })
    }
}

/// Validated preview request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    /// Insurer to settle
    pub insurer_id: InsurerId,

    /// First day of the period
    pub period_start: NaiveDate,

    /// Last day of the period
    pub period_end: NaiveDate,

    /// Computation mode
    pub settlement_type: SettlementType,

    /// Rule sets (SPECIAL only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_rules: Option<Vec<PlanRuleSet>>,
}
