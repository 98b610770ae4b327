//! Page prefetching
//!
//! Prefetch is an optimization, never a correctness requirement: failures
//! are logged and published, not returned. Each fetch runs as its own task
//! keyed by (handle, page) with a cancellation token derived from the
//! draft's token. Discarding the draft cancels every task, and a task that
//! finishes anyway commits through [`PageCache::accept`], which refuses
//! pages issued for another draft. Once the draft is hydrated, every
//! committed page republishes its agreement's figures.

use crate::{
    aggregate::DraftBook,
    backend::SettlementBackend,
    events::{EventBus, ReconcilerEvent},
    page_cache::{FetchedPage, PageCache, PageKey},
    types::CacheHandle,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a prefetch task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    /// Page stored in the cache
    Committed,
    /// Page arrived for a draft that is no longer active
    Stale,
    /// Task cancelled before completion
    Cancelled,
    /// Backend returned an error
    Failed,
}

/// Pages to prefetch after navigating to `page_index`
pub fn window(page_index: u32, page_count: u32, ahead: u32) -> Vec<u32> {
    (1..=ahead)
        .filter_map(|offset| page_index.checked_add(offset))
        .filter(|page| *page < page_count)
        .collect()
}

/// Pages to load eagerly when a draft is created
pub fn initial_window(page_count: u32, initial_pages: u32) -> Vec<u32> {
    (0..page_count.min(initial_pages)).collect()
}

/// Prefetch task registry for one draft
#[derive(Debug)]
pub struct Prefetcher {
    draft_id: Uuid,
    cache: Arc<RwLock<PageCache>>,
    events: EventBus,
    token: CancellationToken,
    book: Option<DraftBook>,
    in_flight: HashMap<PageKey, JoinHandle<PrefetchOutcome>>,
}

impl Prefetcher {
    /// Create a registry bound to a draft's cache
    pub fn new(draft_id: Uuid, cache: Arc<RwLock<PageCache>>, events: EventBus) -> Self {
        Self {
            draft_id,
            cache,
            events,
            token: CancellationToken::new(),
            book: None,
            in_flight: HashMap::new(),
        }
    }

    /// Publish a recompute for every page committed from now on
    pub fn recompute_on_commit(&mut self, book: DraftBook) {
        self.book = Some(book);
    }

    /// Start fetching a page unless it is cached or already in flight.
    /// Returns whether a task was spawned.
    pub fn prefetch<B>(&mut self, backend: &Arc<B>, handle: &CacheHandle, page_index: u32) -> bool
    where
        B: SettlementBackend + 'static,
    {
        self.reap();

        let key = PageKey::new(handle.clone(), page_index);
        if self.in_flight.contains_key(&key) {
            debug!("Prefetch of {} already in flight", key);
            return false;
        }
        if self.cache.read().contains(handle, page_index) {
            return false;
        }
        if self.token.is_cancelled() {
            return false;
        }

        debug!("Prefetching {}", key);

        let task = tokio::spawn(run_fetch(
            Arc::clone(backend),
            Arc::clone(&self.cache),
            self.events.clone(),
            self.book.clone(),
            self.token.child_token(),
            self.draft_id,
            key.clone(),
        ));
        self.in_flight.insert(key, task);
        true
    }

    /// Whether a page is being prefetched
    pub fn is_in_flight(&self, handle: &CacheHandle, page_index: u32) -> bool {
        self.in_flight
            .get(&PageKey::new(handle.clone(), page_index))
            .is_some_and(|task| !task.is_finished())
    }

    /// Wait for the prefetch of one page, if any
    pub async fn join(&mut self, handle: &CacheHandle, page_index: u32) -> Option<PrefetchOutcome> {
        let task = self
            .in_flight
            .remove(&PageKey::new(handle.clone(), page_index))?;
        Some(task.await.unwrap_or(PrefetchOutcome::Failed))
    }

    /// Wait for every task currently in flight
    pub async fn wait_idle(&mut self) -> Vec<PrefetchOutcome> {
        let tasks: Vec<_> = self.in_flight.drain().map(|(_, task)| task).collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(task.await.unwrap_or(PrefetchOutcome::Failed));
        }
        outcomes
    }

    /// Cancel every task; no further prefetch is started
    pub fn cancel_all(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(
                "Cancelling {} prefetch tasks for draft {}",
                self.in_flight.len(),
                self.draft_id
            );
        }
        self.token.cancel();
        self.in_flight.clear();
    }

    fn reap(&mut self) {
        self.in_flight.retain(|_, task| !task.is_finished());
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_fetch<B>(
    backend: Arc<B>,
    cache: Arc<RwLock<PageCache>>,
    events: EventBus,
    book: Option<DraftBook>,
    token: CancellationToken,
    draft_id: Uuid,
    key: PageKey,
) -> PrefetchOutcome
where
    B: SettlementBackend + 'static,
{
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("Prefetch of {} cancelled", key);
            return PrefetchOutcome::Cancelled;
        }
        result = backend.fetch_page(&key.handle, key.page_index) => result,
    };

    match result {
        Ok(rows) => {
            if token.is_cancelled() {
                debug!("Prefetch of {} finished after cancellation, discarding", key);
                events.publish(ReconcilerEvent::StalePageDropped {
                    draft_id,
                    handle: key.handle,
                    page_index: key.page_index,
                });
                return PrefetchOutcome::Stale;
            }

            let committed = cache.write().accept(FetchedPage {
                draft_id,
                handle: key.handle.clone(),
                page_index: key.page_index,
                rows,
            });

            if committed {
                events.publish(ReconcilerEvent::PageLoaded {
                    draft_id,
                    handle: key.handle.clone(),
                    page_index: key.page_index,
                    prefetch: true,
                });
                if let Some(book) = &book {
                    book.publish(&key.handle, &events);
                }
                PrefetchOutcome::Committed
            } else {
                events.publish(ReconcilerEvent::StalePageDropped {
                    draft_id,
                    handle: key.handle,
                    page_index: key.page_index,
                });
                PrefetchOutcome::Stale
            }
        }
        Err(e) => {
            warn!("Prefetch of {} failed: {}", key, e);
            events.publish(ReconcilerEvent::PageFetchFailed {
                draft_id,
                handle: key.handle,
                page_index: key.page_index,
                prefetch: true,
                reason: e.to_string(),
            });
            PrefetchOutcome::Failed
        }
    }
}
