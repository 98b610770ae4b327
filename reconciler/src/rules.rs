//! Special-settlement rule sets
//!
//! A SPECIAL settlement replaces recorded amounts with fixed amounts chosen
//! by quantity range, per plan. Rules for one plan must not cover
//! overlapping quantity ranges; a malformed rule set blocks preview.

use crate::{types::PlanId, Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Quantity range mapped to a fixed amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct QuantityRule {
    /// Lowest quantity covered (inclusive)
    #[validate(range(min = 1))]
    pub min_quantity: u32,

    /// Highest quantity covered (inclusive); open-ended when absent
    pub max_quantity: Option<u32>,

    /// Amount billed for any quantity in range
    pub amount: Decimal,
}

impl QuantityRule {
    fn upper(&self) -> u32 {
        self.max_quantity.unwrap_or(u32::MAX)
    }

    /// Whether two ranges share at least one quantity
    pub fn overlaps(&self, other: &QuantityRule) -> bool {
        self.min_quantity <= other.upper() && other.min_quantity <= self.upper()
    }
}

impl std::fmt::Display for QuantityRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.max_quantity {
            Some(max) => write!(f, "[{}..={}] -> {}", self.min_quantity, max, self.amount),
            None => write!(f, "[{}..] -> {}", self.min_quantity, self.amount),
        }
    }
}

/// Rules for one plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlanRuleSet {
    /// Plan the rules apply to
    pub plan_id: PlanId,

    /// Plan name, for messages
    #[validate(length(min = 1))]
    pub plan_name: String,

    /// Quantity rules
    #[validate(length(min = 1))]
    pub rules: Vec<QuantityRule>,
}

/// Validate every rule set, including cross-set overlap for the same plan
pub fn validate_rule_sets(rule_sets: &[PlanRuleSet]) -> Result<()> {
    let mut by_plan: BTreeMap<PlanId, Vec<(&str, &QuantityRule)>> = BTreeMap::new();

    for set in rule_sets {
        set.validate()
            .map_err(|e| Error::InvalidRules(format!("plan {}: {}", set.plan_id, e)))?;

        for rule in &set.rules {
            rule.validate()
                .map_err(|e| Error::InvalidRules(format!("plan {}: {}", set.plan_id, e)))?;

            if rule.upper() < rule.min_quantity {
                return Err(Error::InvalidRules(format!(
                    "plan {} ({}): range {} is inverted",
                    set.plan_id, set.plan_name, rule
                )));
            }

            if rule.amount.is_sign_negative() {
                return Err(Error::InvalidRules(format!(
                    "plan {} ({}): negative amount in {}",
                    set.plan_id, set.plan_name, rule
                )));
            }

            by_plan
                .entry(set.plan_id)
                .or_default()
                .push((set.plan_name.as_str(), rule));
        }
    }

    for (plan_id, mut rules) in by_plan {
        rules.sort_by_key(|(_, rule)| rule.min_quantity);

        for pair in rules.windows(2) {
            let (name, first) = pair[0];
            let (_, second) = pair[1];
            if first.overlaps(second) {
                return Err(Error::InvalidRules(format!(
                    "plan {} ({}): {} overlaps {}",
                    plan_id, name, first, second
                )));
            }
        }
    }

    Ok(())
}
