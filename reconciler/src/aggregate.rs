//! Agreement aggregate recomputation
//!
//! An aggregate is never patched in place. It is recomputed from three
//! sources after every mutation:
//!
//! - the rows cached for the handle (immutable truth for fetched pages),
//! - the exclusion ledger for the handle,
//! - the preview baseline, which stands in for pages not fetched yet.
//!
//! Unfetched pages contribute `baseline − fetched portion`, with none of
//! their rows excluded (exclusion is only offered on rendered rows). Once
//! every page is cached the baseline is ignored and the figures are exactly
//! the sum over included rows.

use crate::{
    events::{EventBus, ReconcilerEvent},
    exclusion::ExclusionLedger,
    page_cache::PageCache,
    types::{AgreementAggregate, AgreementBaseline, CacheHandle, DraftTotals, ServiceId},
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Recomputed figures for one handle, published after every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateUpdate {
    /// Handle the figures belong to
    pub cache_handle: CacheHandle,

    /// Excluded IDs under the handle, ascending
    pub excluded_ids: Vec<ServiceId>,

    /// Number of excluded IDs
    pub excluded_count: usize,

    /// Included services among cached rows
    pub fetched_services: u64,

    /// Net amount of included cached rows
    pub fetched_subtotal: Decimal,

    /// Included services, projected over the whole result set
    pub total_services: u64,

    /// Net amount of included services, projected over the whole result set
    pub subtotal: Decimal,

    /// Pages cached for the handle
    pub fetched_pages: u32,

    /// Whether every page of the handle is cached
    pub fully_fetched: bool,
}

/// Recompute one agreement from cache, ledger and baseline
pub fn recompute(
    baseline: &AgreementBaseline,
    cache: &PageCache,
    ledger: &ExclusionLedger,
) -> AggregateUpdate {
    let handle = &baseline.cache_handle;
    let excluded = ledger.excluded_ids(handle);

    let mut fetched_rows: u64 = 0;
    let mut fetched_gross = Decimal::ZERO;
    let mut included_rows: u64 = 0;
    let mut included_amount = Decimal::ZERO;

    for row in cache.rows_for(handle) {
        fetched_rows += 1;
        fetched_gross += row.net_amount();

        if !excluded.contains(&row.id) {
            included_rows += 1;
            included_amount += row.net_amount();
        }
    }

    let fetched_pages = cache.fetched_pages(handle);
    let fully_fetched = fetched_pages >= baseline.page_count;

    let (unfetched_rows, unfetched_amount) = if fully_fetched {
        (0, Decimal::ZERO)
    } else {
        (
            baseline.protocols.saturating_sub(fetched_rows),
            (baseline.subtotal - fetched_gross).max(Decimal::ZERO),
        )
    };

    AggregateUpdate {
        cache_handle: handle.clone(),
        excluded_count: excluded.len(),
        excluded_ids: excluded.into_iter().collect(),
        fetched_services: included_rows,
        fetched_subtotal: included_amount,
        total_services: included_rows + unfetched_rows,
        subtotal: included_amount + unfetched_amount,
        fetched_pages,
        fully_fetched,
    }
}

impl AggregateUpdate {
    /// Display row for the draft
    pub fn to_aggregate(&self, baseline: &AgreementBaseline) -> AgreementAggregate {
        AgreementAggregate {
            plan_name: baseline.plan_name.clone(),
            coverage_period_label: baseline.coverage_period_label.clone(),
            cache_handle: baseline.cache_handle.clone(),
            page_count: baseline.page_count,
            fetched_pages: self.fetched_pages,
            included_count: self.total_services,
            excluded_count: self.excluded_count,
            subtotal: self.subtotal,
            fee: baseline.fee,
        }
    }
}

/// Draft-level totals over a set of aggregates
pub fn totals(aggregates: &[AgreementAggregate]) -> DraftTotals {
    DraftTotals {
        total_included_count: aggregates.iter().map(|a| a.included_count).sum(),
        total_amount: aggregates.iter().map(|a| a.subtotal).sum(),
        total_excluded_count: aggregates.iter().map(|a| a.excluded_count).sum(),
    }
}

/// The three recompute sources of one draft, shared with its prefetch tasks.
///
/// Locks are always taken cache first, then ledger, and never held across
/// an await.
#[derive(Debug, Clone)]
pub struct DraftBook {
    baselines: Arc<[AgreementBaseline]>,
    cache: Arc<RwLock<PageCache>>,
    ledger: Arc<RwLock<ExclusionLedger>>,
}

impl DraftBook {
    /// Bind baselines to a draft's cache, with an empty ledger
    pub fn new(baselines: Vec<AgreementBaseline>, cache: Arc<RwLock<PageCache>>) -> Self {
        Self {
            baselines: baselines.into(),
            cache,
            ledger: Arc::new(RwLock::new(ExclusionLedger::new())),
        }
    }

    /// Baselines in preview order
    pub fn baselines(&self) -> &[AgreementBaseline] {
        &self.baselines
    }

    /// Baseline for a handle of this draft
    pub fn baseline(&self, handle: &CacheHandle) -> Option<&AgreementBaseline> {
        self.baselines.iter().find(|b| &b.cache_handle == handle)
    }

    /// Page cache
    pub fn cache(&self) -> &Arc<RwLock<PageCache>> {
        &self.cache
    }

    /// Exclusion ledger
    pub fn ledger(&self) -> &Arc<RwLock<ExclusionLedger>> {
        &self.ledger
    }

    /// Figures for one handle, `None` if the draft does not own it
    pub fn recompute(&self, handle: &CacheHandle) -> Option<AggregateUpdate> {
        let baseline = self.baseline(handle)?;
        let cache = self.cache.read();
        let ledger = self.ledger.read();
        Some(recompute(baseline, &cache, &ledger))
    }

    /// Display rows for every agreement
    pub fn aggregates(&self) -> Vec<AgreementAggregate> {
        let cache = self.cache.read();
        let ledger = self.ledger.read();
        self.baselines
            .iter()
            .map(|b| recompute(b, &cache, &ledger).to_aggregate(b))
            .collect()
    }

    /// Recompute one handle and publish the result with fresh totals
    pub fn publish(&self, handle: &CacheHandle, events: &EventBus) -> Option<AggregateUpdate> {
        let update = self.recompute(handle)?;
        let totals = totals(&self.aggregates());

        events.publish(ReconcilerEvent::AggregateRecomputed {
            update: update.clone(),
            totals,
        });
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProvidedServiceRow, ServiceStatus};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn row(id: i64, covered: Decimal, copay: Decimal) -> ProvidedServiceRow {
        ProvidedServiceRow {
            id: ServiceId(id),
            service_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            origin_label: "North Branch".to_string(),
            analysis_count: 1,
            covered_amount: covered,
            copayment_amount: copay,
            status: ServiceStatus::Billable,
            excluded: false,
        }
    }

    fn baseline(page_count: u32, protocols: u64, subtotal: Decimal) -> AgreementBaseline {
        AgreementBaseline {
            plan_name: "Silver".to_string(),
            coverage_period_label: "2024-H1".to_string(),
            cache_handle: CacheHandle::new("agr-1"),
            page_count,
            protocols,
            fee: Decimal::ZERO,
            subtotal,
        }
    }

    #[test]
    fn test_nothing_fetched_matches_baseline() {
        let baseline = baseline(3, 25, dec!(1250));
        let cache = PageCache::new(Uuid::new_v4(), [baseline.cache_handle.clone()]);
        let ledger = ExclusionLedger::new();

        let update = recompute(&baseline, &cache, &ledger);
        assert_eq!(update.total_services, 25);
        assert_eq!(update.subtotal, dec!(1250));
        assert_eq!(update.fetched_services, 0);
        assert!(!update.fully_fetched);
    }

    #[test]
    fn test_partial_fetch_with_exclusion() {
        let baseline = baseline(2, 3, dec!(230));
        let handle = baseline.cache_handle.clone();
        let mut cache = PageCache::new(Uuid::new_v4(), [handle.clone()]);
        let mut ledger = ExclusionLedger::new();

        cache.put(
            handle.clone(),
            0,
            vec![row(1, dec!(100), dec!(0)), row(2, dec!(50), dec!(0))],
        );
        ledger.exclude(&handle, [ServiceId(2)]);

        let update = recompute(&baseline, &cache, &ledger);
        assert_eq!(update.fetched_services, 1);
        assert_eq!(update.fetched_subtotal, dec!(100));
        assert_eq!(update.total_services, 2);
        assert_eq!(update.subtotal, dec!(180));
        assert_eq!(update.excluded_ids, vec![ServiceId(2)]);
    }

    #[test]
    fn test_copayment_is_deducted() {
        let baseline = baseline(1, 2, dec!(150));
        let handle = baseline.cache_handle.clone();
        let mut cache = PageCache::new(Uuid::new_v4(), [handle.clone()]);

        cache.put(
            handle,
            0,
            vec![row(1, dec!(120), dec!(20)), row(2, dec!(60), dec!(10))],
        );

        let update = recompute(&baseline, &cache, &ExclusionLedger::new());
        assert_eq!(update.subtotal, dec!(150));
        assert!(update.fully_fetched);
    }

    #[test]
    fn test_fully_fetched_ignores_baseline_drift() {
        // Baseline disagrees with the rows; visible rows win
        let baseline = baseline(1, 10, dec!(999));
        let handle = baseline.cache_handle.clone();
        let mut cache = PageCache::new(Uuid::new_v4(), [handle.clone()]);

        cache.put(handle, 0, vec![row(1, dec!(40), dec!(0))]);

        let update = recompute(&baseline, &cache, &ExclusionLedger::new());
        assert_eq!(update.total_services, 1);
        assert_eq!(update.subtotal, dec!(40));
    }

    #[test]
    fn test_unfetched_remainder_never_negative() {
        let baseline = baseline(3, 1, dec!(10));
        let handle = baseline.cache_handle.clone();
        let mut cache = PageCache::new(Uuid::new_v4(), [handle.clone()]);

        cache.put(
            handle,
            0,
            vec![row(1, dec!(40), dec!(0)), row(2, dec!(40), dec!(0))],
        );

        let update = recompute(&baseline, &cache, &ExclusionLedger::new());
        assert_eq!(update.total_services, 2);
        assert_eq!(update.subtotal, dec!(80));
    }

    #[tokio::test]
    async fn test_book_publishes_update_with_totals() {
        let baseline = baseline(2, 3, dec!(230));
        let handle = baseline.cache_handle.clone();
        let cache = Arc::new(RwLock::new(PageCache::new(
            Uuid::new_v4(),
            [handle.clone()],
        )));
        let book = DraftBook::new(vec![baseline], Arc::clone(&cache));
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        cache.write().put(
            handle.clone(),
            0,
            vec![row(1, dec!(100), dec!(0)), row(2, dec!(50), dec!(0))],
        );
        book.ledger().write().exclude(&handle, [ServiceId(2)]);

        let published = book.publish(&handle, &bus).unwrap();
        assert_eq!(published.subtotal, dec!(180));

        match rx.recv().await.unwrap() {
            ReconcilerEvent::AggregateRecomputed { update, totals } => {
                assert_eq!(update, published);
                assert_eq!(totals.total_amount, dec!(180));
                assert_eq!(totals.total_included_count, 2);
                assert_eq!(totals.total_excluded_count, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(book.publish(&CacheHandle::new("agr-other"), &bus).is_none());
    }

    #[test]
    fn test_other_handle_exclusions_ignored() {
        let baseline = baseline(1, 1, dec!(75));
        let handle = baseline.cache_handle.clone();
        let mut cache = PageCache::new(Uuid::new_v4(), [handle.clone()]);
        let mut ledger = ExclusionLedger::new();

        cache.put(handle, 0, vec![row(5, dec!(75), dec!(0))]);
        ledger.exclude(&CacheHandle::new("agr-other"), [ServiceId(5)]);

        let update = recompute(&baseline, &cache, &ledger);
        assert_eq!(update.excluded_count, 0);
        assert_eq!(update.subtotal, dec!(75));
    }
}
