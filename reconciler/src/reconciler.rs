//! Settlement reconciler
//!
//! Orchestrates preview, paging, exclusion and creation for one operator.
//! The reconciler owns at most one draft session at a time; a session bundles
//! the preview baselines with the page cache, exclusion ledger and prefetch
//! tasks that belong to it, and all of them are discarded together.

use crate::{
    aggregate::{totals, AggregateUpdate, DraftBook},
    backend::{CreateSettlementRequest, SettlementBackend},
    config::Config,
    error::FailureKind,
    events::{EventBus, ReconcilerEvent},
    filters::{PreviewRequest, SettlementFilters},
    indicator::BusyIndicator,
    page_cache::{CacheMetrics, FetchedPage, PageCache},
    prefetch::{initial_window, window, Prefetcher},
    state::{ReconcilerState, Transition},
    types::*,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of loading one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// Rows are from the cache
    Loaded,
    /// Fetch failed; the page renders empty and can be retried
    Failed {
        /// Why the fetch failed
        reason: String,
    },
}

/// One page as presented to the operator
#[derive(Debug, Clone, PartialEq)]
pub struct PageView {
    /// Cache handle
    pub handle: CacheHandle,

    /// Zero-based page index
    pub page_index: u32,

    /// Pages available under the handle
    pub page_count: u32,

    /// Rows in server order, `excluded` projected from the ledger
    pub rows: Vec<ProvidedServiceRow>,

    /// Load outcome
    pub state: PageState,
}

impl PageView {
    /// Whether the page needs a retry
    pub fn is_failed(&self) -> bool {
        matches!(self.state, PageState::Failed { .. })
    }
}

/// Last surfaced failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Taxonomy bucket
    pub kind: FailureKind,

    /// Operator-facing message
    pub message: String,

    /// When it happened
    pub at: DateTime<Utc>,
}

/// Everything that lives and dies with one draft
#[derive(Debug)]
struct DraftSession {
    draft_id: Uuid,
    request: PreviewRequest,
    settlement_key: SettlementKey,
    book: DraftBook,
    prefetcher: Prefetcher,
    warnings: Vec<DraftWarning>,
    created_at: DateTime<Utc>,
}

impl DraftSession {
    fn baseline(&self, handle: &CacheHandle) -> Result<&AgreementBaseline> {
        self.book
            .baseline(handle)
            .ok_or_else(|| Error::UnknownHandle(handle.clone()))
    }

    fn owns(&self, handle: &CacheHandle) -> bool {
        self.book.baseline(handle).is_some()
    }

    fn publish(&self, handle: &CacheHandle, events: &EventBus) -> Result<AggregateUpdate> {
        self.book
            .publish(handle, events)
            .ok_or_else(|| Error::UnknownHandle(handle.clone()))
    }

    fn snapshot(&self) -> SettlementDraft {
        let aggregates = self.book.aggregates();
        let totals = totals(&aggregates);

        SettlementDraft {
            draft_id: self.draft_id,
            insurer_id: self.request.insurer_id,
            period_start: self.request.period_start,
            period_end: self.request.period_end,
            settlement_type: self.request.settlement_type,
            special_rules: self.request.special_rules.clone().unwrap_or_default(),
            total_included_count: totals.total_included_count,
            total_amount: totals.total_amount,
            aggregates,
            settlement_key: self.settlement_key.clone(),
            warnings: self.warnings.clone(),
            created_at: self.created_at,
        }
    }

    fn project(&self, handle: &CacheHandle, mut rows: Vec<ProvidedServiceRow>) -> Vec<ProvidedServiceRow> {
        let ledger = self.book.ledger().read();
        for row in &mut rows {
            row.excluded = ledger.is_excluded(handle, row.id);
        }
        rows
    }

    fn ensure_cached(&self, handle: &CacheHandle, id: ServiceId) -> Result<()> {
        if self.book.cache().read().contains_row(handle, id) {
            Ok(())
        } else {
            Err(Error::RowNotCached {
                handle: handle.clone(),
                id,
            })
        }
    }

    fn create_request(&self) -> CreateSettlementRequest {
        CreateSettlementRequest {
            insurer_id: self.request.insurer_id,
            period_start: self.request.period_start,
            period_end: self.request.period_end,
            settlement_type: self.request.settlement_type,
            excluded_provided_services_ids: self.book.ledger().read().union_all(),
            special_rules: self.request.special_rules.clone(),
            settlement_key: self.settlement_key.clone(),
        }
    }
}

/// Settlement reconciler
#[derive(Debug)]
pub struct SettlementReconciler<B: SettlementBackend + 'static> {
    /// Backend collaborator
    backend: Arc<B>,

    /// Configuration
    config: Config,

    /// State machine
    state: ReconcilerState,

    /// Active draft, if any
    session: Option<DraftSession>,

    /// Event bus
    events: EventBus,

    /// Last surfaced failure
    last_failure: Option<Failure>,
}

impl<B: SettlementBackend + 'static> SettlementReconciler<B> {
    /// Create a reconciler in `Idle`
    pub fn new(backend: Arc<B>, config: Config) -> Self {
        let events = EventBus::new(config.events.channel_capacity);

        tracing::info!(
            "Settlement reconciler {} v{} using backend '{}'",
            config.service_name,
            config.service_version,
            backend.name()
        );

        Self {
            backend,
            config,
            state: ReconcilerState::Idle,
            session: None,
            events,
            last_failure: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// Last surfaced failure
    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    /// Subscribe to reconciler events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ReconcilerEvent> {
        self.events.subscribe()
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of the active draft with freshly recomputed aggregates
    pub fn draft(&self) -> Option<SettlementDraft> {
        self.session.as_ref().map(DraftSession::snapshot)
    }

    /// Cache counters of the active draft
    pub fn cache_stats(&self) -> Option<CacheMetrics> {
        self.session.as_ref().map(|s| s.book.cache().read().metrics())
    }

    /// Run a preview, replacing any current draft.
    ///
    /// Filters are validated before anything is discarded or sent, so an
    /// incomplete selection or a malformed rule set leaves the current draft
    /// in place. Once the request is dispatched the previous draft, its cache
    /// and its exclusions are gone regardless of the outcome.
    pub async fn preview(&mut self, filters: &SettlementFilters) -> Result<SettlementDraft> {
        let request = match filters.validate() {
            Ok(request) => request,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        if !self.state.can_transition_to(&ReconcilerState::Previewing) {
            return Err(Error::InvalidTransition {
                from: self.state.name().to_string(),
                to: ReconcilerState::Previewing.name().to_string(),
            });
        }

        self.close_session();

        tracing::info!(
            "Previewing {} settlement for insurer {} ({} to {})",
            request.settlement_type,
            request.insurer_id,
            request.period_start,
            request.period_end
        );

        let events = self.events.clone();
        let flight = Transition::begin(
            &mut self.state,
            ReconcilerState::Previewing,
            ReconcilerState::Idle,
        )?;
        events.publish(ReconcilerEvent::PreviewStarted);

        let indicator =
            BusyIndicator::show("preview", self.config.indicator.min_visible(), &events);
        let opened = open_session(&self.backend, &self.config, &events, request).await;
        indicator.dismiss().await;

        match opened {
            Ok(session) => {
                flight.settle(ReconcilerState::Ready)?;

                let draft = session.snapshot();
                tracing::info!(
                    "Draft {} ready: {} agreements, {} services, total {}",
                    draft.draft_id,
                    draft.aggregates.len(),
                    draft.total_included_count,
                    draft.total_amount
                );
                if draft.is_empty() {
                    tracing::warn!("Preview {} has no billable services", draft.settlement_key);
                }

                events.publish(ReconcilerEvent::DraftReady {
                    draft_id: draft.draft_id,
                    settlement_key: draft.settlement_key.clone(),
                    warnings: draft.warnings.clone(),
                });

                self.session = Some(session);
                self.last_failure = None;
                Ok(draft)
            }
            Err(e) => {
                flight.settle(ReconcilerState::Failed(e.failure_kind()))?;
                self.record_failure(&e);
                self.state.transition(ReconcilerState::Idle)?;
                Err(e)
            }
        }
    }

    /// Load one page, from cache when possible.
    ///
    /// A page that cannot be fetched comes back empty with
    /// [`PageState::Failed`]; the draft and other pages are unaffected.
    pub async fn get_page(&mut self, handle: &CacheHandle, page_index: u32) -> Result<PageView> {
        let Self {
            backend,
            config,
            session,
            events,
            ..
        } = self;
        let backend = &*backend;
        let session = session.as_mut().ok_or(Error::NoDraft)?;

        let page_count = session.baseline(handle)?.page_count;
        if page_index >= page_count {
            return Err(Error::PageOutOfRange {
                handle: handle.clone(),
                page: page_index,
                page_count,
            });
        }

        // A prefetch already on the way is cheaper than a second request
        if session.prefetcher.is_in_flight(handle, page_index) {
            session.prefetcher.join(handle, page_index).await;
        }

        let cached = session.book.cache().write().lookup(handle, page_index);
        let view = match cached {
            Some(rows) => PageView {
                handle: handle.clone(),
                page_index,
                page_count,
                rows: session.project(handle, rows),
                state: PageState::Loaded,
            },
            None => match backend.fetch_page(handle, page_index).await {
                Ok(rows) => {
                    session.book.cache().write().accept(FetchedPage {
                        draft_id: session.draft_id,
                        handle: handle.clone(),
                        page_index,
                        rows: rows.clone(),
                    });
                    events.publish(ReconcilerEvent::PageLoaded {
                        draft_id: session.draft_id,
                        handle: handle.clone(),
                        page_index,
                        prefetch: false,
                    });

                    session.publish(handle, events)?;

                    PageView {
                        handle: handle.clone(),
                        page_index,
                        page_count,
                        rows: session.project(handle, rows),
                        state: PageState::Loaded,
                    }
                }
                Err(e) => {
                    tracing::warn!("Page {}#{} failed to load: {}", handle, page_index, e);
                    events.publish(ReconcilerEvent::PageFetchFailed {
                        draft_id: session.draft_id,
                        handle: handle.clone(),
                        page_index,
                        prefetch: false,
                        reason: e.to_string(),
                    });

                    PageView {
                        handle: handle.clone(),
                        page_index,
                        page_count,
                        rows: Vec::new(),
                        state: PageState::Failed {
                            reason: e.to_string(),
                        },
                    }
                }
            },
        };

        for page in window(page_index, page_count, config.paging.prefetch_ahead) {
            session.prefetcher.prefetch(backend, handle, page);
        }

        Ok(view)
    }

    /// Fetch a page again after a failure
    pub async fn retry_page(&mut self, handle: &CacheHandle, page_index: u32) -> Result<PageView> {
        tracing::info!("Retrying page {}#{}", handle, page_index);
        self.get_page(handle, page_index).await
    }

    /// Flip exclusion of one rendered row
    pub fn toggle_exclude(&mut self, handle: &CacheHandle, id: ServiceId) -> Result<AggregateUpdate> {
        let session = self.session.as_mut().ok_or(Error::NoDraft)?;
        session.baseline(handle)?;

        if !session.book.ledger().read().is_excluded(handle, id) {
            session.ensure_cached(handle, id)?;
        }

        let excluded = session.book.ledger().write().toggle(handle, id);
        tracing::debug!(
            "{} service {} under {}",
            if excluded { "Excluded" } else { "Re-included" },
            id,
            handle
        );

        self.publish_recompute(handle)
    }

    /// Exclude several rendered rows at once. Either all are excluded or,
    /// when one of them is not cached, none is.
    pub fn exclude_rows(
        &mut self,
        handle: &CacheHandle,
        ids: impl IntoIterator<Item = ServiceId>,
    ) -> Result<AggregateUpdate> {
        let session = self.session.as_mut().ok_or(Error::NoDraft)?;
        session.baseline(handle)?;

        let ids: Vec<ServiceId> = ids.into_iter().collect();
        for id in &ids {
            session.ensure_cached(handle, *id)?;
        }

        let added = session.book.ledger().write().exclude(handle, ids);
        tracing::debug!("Excluded {} services under {}", added, handle);

        self.publish_recompute(handle)
    }

    /// Re-include one row.
    ///
    /// Returns `None` when there is no draft or the handle is not part of it
    /// (for instance a row from a draft that was replaced meanwhile).
    pub fn reinclude(
        &mut self,
        handle: &CacheHandle,
        id: ServiceId,
    ) -> Result<Option<AggregateUpdate>> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        if !session.owns(handle) {
            tracing::debug!("Ignoring re-include on {}: not part of the current draft", handle);
            return Ok(None);
        }

        session.book.ledger().write().reinclude(handle, id);
        self.publish_recompute(handle).map(Some)
    }

    /// Re-include every row of one agreement
    pub fn clear_exclusions(&mut self, handle: &CacheHandle) -> Result<AggregateUpdate> {
        let session = self.session.as_mut().ok_or(Error::NoDraft)?;
        session.baseline(handle)?;

        let cleared = session.book.ledger().write().clear(handle);
        tracing::debug!("Cleared {} exclusions under {}", cleared, handle);

        self.publish_recompute(handle)
    }

    /// Draft-level totals
    pub fn current_totals(&self) -> Result<DraftTotals> {
        self.session
            .as_ref()
            .map(|s| s.snapshot().totals())
            .ok_or(Error::NoDraft)
    }

    /// Persist the draft as a settlement.
    ///
    /// On failure the draft and its exclusions are kept so the operator can
    /// confirm again without redoing any work.
    pub async fn confirm_and_create(&mut self) -> Result<SettlementId> {
        let request = self
            .session
            .as_ref()
            .map(DraftSession::create_request)
            .ok_or(Error::NoDraft)?;

        let events = self.events.clone();
        let flight = Transition::begin(
            &mut self.state,
            ReconcilerState::Generating,
            ReconcilerState::Ready,
        )?;

        tracing::info!(
            "Creating settlement {} with {} excluded services",
            request.settlement_key,
            request.excluded_provided_services_ids.len()
        );

        let indicator = BusyIndicator::show("create", self.config.indicator.min_visible(), &events);
        let created = self.backend.create_settlement(&request).await;
        indicator.dismiss().await;

        match created {
            Ok(settlement_id) => {
                flight.settle(ReconcilerState::Created(settlement_id))?;
                self.close_session();
                self.last_failure = None;

                tracing::info!("Settlement {} created from {}", settlement_id, request.settlement_key);
                events.publish(ReconcilerEvent::SettlementCreated { settlement_id });

                Ok(settlement_id)
            }
            Err(e) => {
                flight.settle(ReconcilerState::Failed(e.failure_kind()))?;
                self.record_failure(&e);
                self.state.transition(ReconcilerState::Ready)?;
                Err(e)
            }
        }
    }

    /// Drop the current draft and return to `Idle`
    pub fn discard(&mut self) -> Option<Uuid> {
        let draft_id = self.close_session();
        if self.state.can_transition_to(&ReconcilerState::Idle) {
            self.state = ReconcilerState::Idle;
        }
        draft_id
    }

    fn publish_recompute(&self, handle: &CacheHandle) -> Result<AggregateUpdate> {
        let session = self.session.as_ref().ok_or(Error::NoDraft)?;
        session.publish(handle, &self.events)
    }

    fn close_session(&mut self) -> Option<Uuid> {
        let mut session = self.session.take()?;
        session.prefetcher.cancel_all();

        tracing::debug!("Discarding draft {}", session.draft_id);
        self.events.publish(ReconcilerEvent::DraftDiscarded {
            draft_id: session.draft_id,
        });

        Some(session.draft_id)
    }

    fn record_failure(&mut self, error: &Error) {
        let kind = error.failure_kind();
        if kind.is_warning() {
            tracing::warn!("Operation rejected ({}): {}", kind, error);
        } else {
            tracing::error!("Operation failed ({}): {}", kind, error);
        }

        self.events.publish(ReconcilerEvent::OperationFailed {
            kind,
            message: error.to_string(),
        });
        self.last_failure = Some(Failure {
            kind,
            message: error.to_string(),
            at: Utc::now(),
        });
    }
}

async fn open_session<B: SettlementBackend + 'static>(
    backend: &Arc<B>,
    config: &Config,
    events: &EventBus,
    request: PreviewRequest,
) -> Result<DraftSession> {
    // Step 1: server computes the preview
    let response = backend.preview_settlement(&request).await?;
    if response.agreements.is_empty() {
        return Err(Error::NoActivePlans {
            insurer_id: request.insurer_id,
        });
    }

    let warnings = if response.total_protocols() == 0 {
        vec![DraftWarning::EmptyResult]
    } else {
        Vec::new()
    };

    // Step 2: fresh cache for the new draft's handles
    let draft_id = Uuid::new_v4();
    let cache = Arc::new(RwLock::new(PageCache::new(
        draft_id,
        response.agreements.iter().map(|a| a.cache_handle.clone()),
    )));
    let book = DraftBook::new(response.agreements, Arc::clone(&cache));

    // Step 3: hydrate the first pages of every agreement
    let mut prefetcher = Prefetcher::new(draft_id, cache, events.clone());
    for baseline in book.baselines() {
        for page in initial_window(baseline.page_count, config.paging.initial_pages) {
            prefetcher.prefetch(backend, &baseline.cache_handle, page);
        }
    }
    prefetcher.wait_idle().await;

    // Step 4: publish hydrated figures, then keep them current as pages land
    for baseline in book.baselines() {
        book.publish(&baseline.cache_handle, events);
    }
    prefetcher.recompute_on_commit(book.clone());

    Ok(DraftSession {
        draft_id,
        request,
        settlement_key: response.settlement_key,
        book,
        prefetcher,
        warnings,
        created_at: Utc::now(),
    })
}
