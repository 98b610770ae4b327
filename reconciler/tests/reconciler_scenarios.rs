//! End-to-end reconciler scenarios against the in-memory backend

use chrono::NaiveDate;
use reconciler::{
    config::PagingConfig,
    memory::{InMemoryBackend, MemoryAgreement},
    CacheHandle, Config, Error, FailureKind, InsurerId, PageState, PlanId, PlanRuleSet,
    ProvidedServiceRow, QuantityRule, ReconcilerEvent, ReconcilerState, ServiceId, ServiceStatus,
    SettlementFilters, SettlementReconciler,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn row(id: i64, amount: Decimal) -> ProvidedServiceRow {
    ProvidedServiceRow {
        id: ServiceId(id),
        service_date: NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        origin_label: "Central Lab".to_string(),
        analysis_count: 1,
        covered_amount: amount,
        copayment_amount: Decimal::ZERO,
        status: ServiceStatus::Billable,
        excluded: false,
    }
}

fn rows(count: i64) -> Vec<ProvidedServiceRow> {
    (1..=count).map(|id| row(id, dec!(10))).collect()
}

fn filters(insurer: i64) -> SettlementFilters {
    SettlementFilters::simple(
        InsurerId(insurer),
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
    )
}

fn config(initial_pages: u32, prefetch_ahead: u32) -> Config {
    Config {
        paging: PagingConfig {
            initial_pages,
            prefetch_ahead,
        },
        ..Default::default()
    }
}

/// One agreement with two pages: [1 → 100, 2 → 50] and [3 → 80]
fn two_page_backend() -> Arc<InMemoryBackend> {
    Arc::new(
        InMemoryBackend::new().with_page_size(2).with_agreement(
            InsurerId(1),
            MemoryAgreement::new(
                "Gold",
                "agr-gold",
                vec![row(1, dec!(100)), row(2, dec!(50)), row(3, dec!(80))],
            ),
        ),
    )
}

fn drain(rx: &mut broadcast::Receiver<ReconcilerEvent>) -> Vec<ReconcilerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_exclusion_before_remaining_pages_fetched() {
    let mut reconciler = SettlementReconciler::new(two_page_backend(), config(1, 0));
    let handle = CacheHandle::new("agr-gold");

    let draft = reconciler.preview(&filters(1)).await.unwrap();
    assert_eq!(draft.aggregates[0].fetched_pages, 1);
    assert_eq!(draft.total_amount, dec!(230));

    let update = reconciler.toggle_exclude(&handle, ServiceId(2)).unwrap();
    assert_eq!(update.fetched_services, 1);
    assert_eq!(update.fetched_subtotal, dec!(100));
    assert_eq!(update.total_services, 2);
    assert_eq!(update.subtotal, dec!(180));
    assert!(!update.fully_fetched);

    let page = reconciler.get_page(&handle, 1).await.unwrap();
    assert_eq!(page.state, PageState::Loaded);
    assert_eq!(page.rows.len(), 1);

    let draft = reconciler.draft().unwrap();
    let aggregate = &draft.aggregates[0];
    assert_eq!(aggregate.fetched_pages, 2);
    assert_eq!(aggregate.included_count, 2);
    assert_eq!(aggregate.excluded_count, 1);
    assert_eq!(aggregate.subtotal, dec!(180));
    assert_eq!(draft.total_amount, dec!(180));

    let totals = reconciler.current_totals().unwrap();
    assert_eq!(totals.total_included_count, 2);
    assert_eq!(totals.total_amount, dec!(180));
    assert_eq!(totals.total_excluded_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_payload_independent_of_browse_order() {
    let mut payloads = Vec::new();

    for pages in [vec![0, 1], vec![1, 0]] {
        let backend = two_page_backend();
        let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), config(1, 0));
        let handle = CacheHandle::new("agr-gold");

        let draft = reconciler.preview(&filters(1)).await.unwrap();
        for page in pages {
            reconciler.get_page(&handle, page).await.unwrap();
        }
        reconciler.toggle_exclude(&handle, ServiceId(2)).unwrap();

        let settlement_id = reconciler.confirm_and_create().await.unwrap();
        assert_eq!(reconciler.state(), ReconcilerState::Created(settlement_id));
        assert!(reconciler.draft().is_none());

        let requests = backend.create_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].settlement_key, draft.settlement_key);
        payloads.push(requests[0].clone());
    }

    assert_eq!(payloads[0].excluded_provided_services_ids, vec![ServiceId(2)]);
    assert_eq!(payloads[0], payloads[1]);
}

#[tokio::test(start_paused = true)]
async fn test_no_active_plans_never_reaches_ready() {
    let backend = two_page_backend();
    let mut reconciler = SettlementReconciler::new(backend, Config::default());
    let mut rx = reconciler.subscribe();

    let err = reconciler.preview(&filters(99)).await.unwrap_err();

    assert!(matches!(err, Error::NoActivePlans { insurer_id: InsurerId(99) }));
    assert!(reconciler.draft().is_none());
    assert_eq!(reconciler.state(), ReconcilerState::Idle);
    assert_eq!(
        reconciler.last_failure().map(|f| f.kind),
        Some(FailureKind::NoActivePlans)
    );

    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ReconcilerEvent::DraftReady { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ReconcilerEvent::OperationFailed {
            kind: FailureKind::NoActivePlans,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_no_active_plans_discards_previous_draft() {
    let mut reconciler = SettlementReconciler::new(two_page_backend(), Config::default());

    reconciler.preview(&filters(1)).await.unwrap();
    assert_eq!(reconciler.state(), ReconcilerState::Ready);

    assert!(reconciler.preview(&filters(99)).await.is_err());
    assert!(reconciler.draft().is_none());
    assert_eq!(reconciler.state(), ReconcilerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_late_pages_never_reach_new_draft() {
    let backend = Arc::new(
        InMemoryBackend::new()
            .with_page_size(2)
            .with_agreement(InsurerId(1), MemoryAgreement::new("Gold", "agr-shared", rows(6))),
    );
    backend.set_page_latency(Duration::from_millis(500));

    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), config(1, 2));
    let mut rx = reconciler.subscribe();
    let handle = CacheHandle::new("agr-shared");

    let first = reconciler.preview(&filters(1)).await.unwrap();
    reconciler.get_page(&handle, 0).await.unwrap();

    // Pages 1 and 2 of the first draft are still on the wire
    let second = reconciler.preview(&filters(1)).await.unwrap();
    assert_ne!(first.draft_id, second.draft_id);
    assert_eq!(second.aggregates[0].cache_handle, handle);

    tokio::time::sleep(Duration::from_secs(5)).await;

    let draft = reconciler.draft().unwrap();
    assert_eq!(draft.draft_id, second.draft_id);
    assert_eq!(draft.aggregates[0].fetched_pages, 1);
    assert_eq!(reconciler.cache_stats().unwrap().puts, 1);

    let events = drain(&mut rx);
    let discarded_at = events
        .iter()
        .position(|e| *e == ReconcilerEvent::DraftDiscarded { draft_id: first.draft_id })
        .unwrap();
    assert!(!events[discarded_at..].iter().any(|e| matches!(
        e,
        ReconcilerEvent::PageLoaded { draft_id, .. } if *draft_id == first.draft_id
    )));
}

#[tokio::test(start_paused = true)]
async fn test_indicator_held_for_minimum_on_fast_preview() {
    let mut reconciler = SettlementReconciler::new(two_page_backend(), Config::default());
    let mut rx = reconciler.subscribe();

    reconciler.preview(&filters(1)).await.unwrap();

    let visible_for = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            ReconcilerEvent::IndicatorDismissed {
                label: "preview",
                visible_for,
            } => Some(visible_for),
            _ => None,
        })
        .unwrap();
    assert!(visible_for >= Duration::from_millis(800));
}

#[tokio::test(start_paused = true)]
async fn test_indicator_not_extended_on_slow_preview() {
    let backend = two_page_backend();
    backend.set_preview_latency(Duration::from_secs(2));
    let mut reconciler = SettlementReconciler::new(backend, Config::default());
    let mut rx = reconciler.subscribe();

    reconciler.preview(&filters(1)).await.unwrap();

    let visible_for = drain(&mut rx)
        .into_iter()
        .find_map(|e| match e {
            ReconcilerEvent::IndicatorDismissed { visible_for, .. } => Some(visible_for),
            _ => None,
        })
        .unwrap();
    assert!(visible_for >= Duration::from_secs(2));
    assert!(visible_for < Duration::from_millis(2800));
}

#[tokio::test(start_paused = true)]
async fn test_failed_page_is_isolated_and_retryable() {
    let backend = two_page_backend();
    let handle = CacheHandle::new("agr-gold");
    backend.fail_page(&handle, 1, 1);

    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), config(1, 0));
    reconciler.preview(&filters(1)).await.unwrap();

    let failed = reconciler.get_page(&handle, 1).await.unwrap();
    assert!(failed.is_failed());
    assert!(failed.rows.is_empty());
    assert_eq!(reconciler.state(), ReconcilerState::Ready);

    let first = reconciler.get_page(&handle, 0).await.unwrap();
    assert_eq!(first.rows.len(), 2);

    let retried = reconciler.retry_page(&handle, 1).await.unwrap();
    assert_eq!(retried.state, PageState::Loaded);
    assert_eq!(retried.rows[0].id, ServiceId(3));
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_failure_is_swallowed() {
    let backend = two_page_backend();
    let handle = CacheHandle::new("agr-gold");
    backend.fail_page(&handle, 1, 1);

    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), Config::default());
    let mut rx = reconciler.subscribe();

    let draft = reconciler.preview(&filters(1)).await.unwrap();
    assert_eq!(draft.aggregates[0].fetched_pages, 1);

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        ReconcilerEvent::PageFetchFailed {
            page_index: 1,
            prefetch: true,
            ..
        }
    )));

    let page = reconciler.get_page(&handle, 1).await.unwrap();
    assert_eq!(page.state, PageState::Loaded);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_special_rules_block_preview() {
    let backend = two_page_backend();
    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), Config::default());

    let rules = vec![PlanRuleSet {
        plan_id: PlanId(4),
        plan_name: "Gold".to_string(),
        rules: vec![
            QuantityRule {
                min_quantity: 1,
                max_quantity: Some(5),
                amount: dec!(100),
            },
            QuantityRule {
                min_quantity: 5,
                max_quantity: None,
                amount: dec!(80),
            },
        ],
    }];
    let filters = SettlementFilters::special(
        InsurerId(1),
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
        rules,
    );

    let err = reconciler.preview(&filters).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRules(_)));
    assert_eq!(reconciler.state(), ReconcilerState::Idle);
    assert!(backend.preview_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_special_rules_travel_with_create() {
    let backend = two_page_backend();
    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), Config::default());

    let rules = vec![PlanRuleSet {
        plan_id: PlanId(4),
        plan_name: "Gold".to_string(),
        rules: vec![QuantityRule {
            min_quantity: 1,
            max_quantity: None,
            amount: dec!(95),
        }],
    }];
    let filters = SettlementFilters::special(
        InsurerId(1),
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
        rules.clone(),
    );

    let draft = reconciler.preview(&filters).await.unwrap();
    assert_eq!(draft.special_rules, rules);

    reconciler.confirm_and_create().await.unwrap();
    assert_eq!(backend.create_requests()[0].special_rules, Some(rules));
}

#[tokio::test(start_paused = true)]
async fn test_failed_create_keeps_exclusions() {
    let backend = two_page_backend();
    backend.fail_next_creates(1);

    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), Config::default());
    let handle = CacheHandle::new("agr-gold");
    let draft = reconciler.preview(&filters(1)).await.unwrap();
    reconciler
        .exclude_rows(&handle, [ServiceId(1), ServiceId(3)])
        .unwrap();

    let err = reconciler.confirm_and_create().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(reconciler.state(), ReconcilerState::Ready);
    assert_eq!(
        reconciler.last_failure().map(|f| f.kind),
        Some(FailureKind::Transport)
    );

    let kept = reconciler.draft().unwrap();
    assert_eq!(kept.draft_id, draft.draft_id);
    assert_eq!(kept.totals().total_excluded_count, 2);

    reconciler.confirm_and_create().await.unwrap();
    let requests = backend.create_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].excluded_provided_services_ids,
        vec![ServiceId(1), ServiceId(3)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_preview_transport_failure_returns_to_idle() {
    let backend = two_page_backend();
    backend.set_transport_down(true);
    let mut reconciler = SettlementReconciler::new(backend, Config::default());

    let err = reconciler.preview(&filters(1)).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(reconciler.state(), ReconcilerState::Idle);
    assert_eq!(
        reconciler.last_failure().map(|f| f.kind),
        Some(FailureKind::Transport)
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_result_flags_draft() {
    let backend = Arc::new(
        InMemoryBackend::new()
            .with_agreement(InsurerId(2), MemoryAgreement::new("Basic", "agr-empty", Vec::new())),
    );
    let mut reconciler = SettlementReconciler::new(backend, Config::default());

    let draft = reconciler.preview(&filters(2)).await.unwrap();
    assert!(draft.is_empty());
    assert_eq!(draft.total_included_count, 0);
    assert_eq!(reconciler.state(), ReconcilerState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_re_preview_drops_exclusions() {
    let mut reconciler = SettlementReconciler::new(two_page_backend(), Config::default());
    let handle = CacheHandle::new("agr-gold");

    reconciler.preview(&filters(1)).await.unwrap();
    reconciler.toggle_exclude(&handle, ServiceId(1)).unwrap();
    assert_eq!(reconciler.current_totals().unwrap().total_excluded_count, 1);

    reconciler.preview(&filters(1)).await.unwrap();
    assert_eq!(reconciler.current_totals().unwrap().total_excluded_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exclusion_requires_rendered_row() {
    let mut reconciler = SettlementReconciler::new(two_page_backend(), config(1, 0));
    let handle = CacheHandle::new("agr-gold");
    reconciler.preview(&filters(1)).await.unwrap();

    let err = reconciler.toggle_exclude(&handle, ServiceId(3)).unwrap_err();
    assert!(matches!(err, Error::RowNotCached { .. }));

    // Bulk exclusion is all or nothing
    let err = reconciler
        .exclude_rows(&handle, [ServiceId(1), ServiceId(3)])
        .unwrap_err();
    assert!(matches!(err, Error::RowNotCached { .. }));
    assert_eq!(reconciler.current_totals().unwrap().total_excluded_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reinclude_on_replaced_handle_is_noop() {
    let backend = Arc::new(
        InMemoryBackend::new()
            .with_agreement(InsurerId(1), MemoryAgreement::new("Gold", "agr-gold", rows(3)))
            .with_agreement(InsurerId(2), MemoryAgreement::new("Basic", "agr-basic", rows(3))),
    );
    let mut reconciler = SettlementReconciler::new(backend, Config::default());
    let old_handle = CacheHandle::new("agr-gold");

    reconciler.preview(&filters(1)).await.unwrap();
    reconciler.toggle_exclude(&old_handle, ServiceId(1)).unwrap();
    reconciler.preview(&filters(2)).await.unwrap();

    assert!(reconciler
        .reinclude(&old_handle, ServiceId(1))
        .unwrap()
        .is_none());
    assert!(matches!(
        reconciler.toggle_exclude(&old_handle, ServiceId(1)),
        Err(Error::UnknownHandle(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_clear_exclusions_restores_totals() {
    let mut reconciler = SettlementReconciler::new(two_page_backend(), Config::default());
    let handle = CacheHandle::new("agr-gold");
    reconciler.preview(&filters(1)).await.unwrap();

    reconciler
        .exclude_rows(&handle, [ServiceId(1), ServiceId(2)])
        .unwrap();
    assert_eq!(reconciler.current_totals().unwrap().total_amount, dec!(80));

    let update = reconciler.clear_exclusions(&handle).unwrap();
    assert_eq!(update.excluded_count, 0);
    assert_eq!(update.subtotal, dec!(230));
}

#[tokio::test(start_paused = true)]
async fn test_navigation_prefetches_ahead() {
    let backend = Arc::new(
        InMemoryBackend::new()
            .with_page_size(2)
            .with_agreement(InsurerId(1), MemoryAgreement::new("Gold", "agr-long", rows(20))),
    );
    let mut reconciler = SettlementReconciler::new(Arc::clone(&backend), Config::default());
    let handle = CacheHandle::new("agr-long");

    let draft = reconciler.preview(&filters(1)).await.unwrap();
    assert_eq!(draft.aggregates[0].page_count, 10);
    assert_eq!(draft.aggregates[0].fetched_pages, 3);

    reconciler.get_page(&handle, 5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Page 5 itself plus 6 and 7 ahead
    assert_eq!(reconciler.draft().unwrap().aggregates[0].fetched_pages, 6);

    let requested: Vec<u32> = backend.page_requests().into_iter().map(|(_, page)| page).collect();
    assert_eq!(requested.iter().filter(|page| **page == 6).count(), 1);

    let page = reconciler.get_page(&handle, 6).await.unwrap();
    assert_eq!(page.rows.len(), 2);
    assert_eq!(reconciler.cache_stats().unwrap().hits, 1);
}

fn recomputed(events: &[ReconcilerEvent]) -> Vec<(CacheHandle, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            ReconcilerEvent::AggregateRecomputed { update, .. } => {
                Some((update.cache_handle.clone(), update.fetched_pages))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_hydration_and_prefetch_publish_recomputes() {
    let backend = Arc::new(
        InMemoryBackend::new()
            .with_page_size(2)
            .with_agreement(InsurerId(1), MemoryAgreement::new("Gold", "agr-gold", rows(6)))
            .with_agreement(InsurerId(1), MemoryAgreement::new("Silver", "agr-silver", rows(2))),
    );
    let mut reconciler = SettlementReconciler::new(backend, config(1, 2));
    let mut rx = reconciler.subscribe();
    let gold = CacheHandle::new("agr-gold");
    let silver = CacheHandle::new("agr-silver");

    reconciler.preview(&filters(1)).await.unwrap();
    assert_eq!(
        recomputed(&drain(&mut rx)),
        vec![(gold.clone(), 1), (silver.clone(), 1)]
    );

    reconciler.get_page(&gold, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let events = drain(&mut rx);
    let prefetched = events
        .iter()
        .filter(|e| matches!(e, ReconcilerEvent::PageLoaded { prefetch: true, .. }))
        .count();
    let mut updates = recomputed(&events);
    updates.sort();

    assert_eq!(prefetched, 2);
    assert_eq!(updates, vec![(gold.clone(), 2), (gold.clone(), 3)]);

    let last = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ReconcilerEvent::AggregateRecomputed { update, totals } => Some((update, totals)),
            _ => None,
        })
        .unwrap();
    assert!(last.0.fully_fetched);
    assert_eq!(last.0.fetched_subtotal, dec!(60));
    assert_eq!(last.1.total_amount, dec!(80));
    assert_eq!(reconciler.draft().unwrap().aggregates[0].fetched_pages, 3);
}
