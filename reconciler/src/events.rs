//! Reconciler events
//!
//! Everything the surrounding UI needs to redraw is published here:
//! indicator visibility, page arrivals and failures, recomputed aggregates.

use crate::{
    aggregate::AggregateUpdate,
    error::FailureKind,
    types::{CacheHandle, DraftTotals, DraftWarning, SettlementId, SettlementKey},
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Event published by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilerEvent {
    /// Preview request dispatched
    PreviewStarted,

    /// Busy indicator shown
    IndicatorShown {
        /// Operation the indicator covers
        label: &'static str,
    },

    /// Busy indicator dismissed
    IndicatorDismissed {
        /// Operation the indicator covered
        label: &'static str,
        /// Time the indicator stayed visible
        visible_for: Duration,
    },

    /// Draft created and hydrated
    DraftReady {
        /// Draft ID
        draft_id: Uuid,
        /// Preview handle
        settlement_key: SettlementKey,
        /// Non-fatal conditions
        warnings: Vec<DraftWarning>,
    },

    /// Draft discarded (new preview, creation, or explicit discard)
    DraftDiscarded {
        /// Draft ID
        draft_id: Uuid,
    },

    /// Page committed to the cache
    PageLoaded {
        /// Draft the page belongs to
        draft_id: Uuid,
        /// Cache handle
        handle: CacheHandle,
        /// Zero-based page index
        page_index: u32,
        /// Loaded ahead of navigation
        prefetch: bool,
    },

    /// Page could not be loaded
    PageFetchFailed {
        /// Draft the page belongs to
        draft_id: Uuid,
        /// Cache handle
        handle: CacheHandle,
        /// Zero-based page index
        page_index: u32,
        /// Loaded ahead of navigation
        prefetch: bool,
        /// Backend error message
        reason: String,
    },

    /// Late page for a discarded draft was dropped
    StalePageDropped {
        /// Draft the page was issued for
        draft_id: Uuid,
        /// Cache handle
        handle: CacheHandle,
        /// Zero-based page index
        page_index: u32,
    },

    /// Aggregate recomputed after hydration, a page arrival or an exclusion change
    AggregateRecomputed {
        /// Figures for the affected agreement
        update: AggregateUpdate,
        /// Draft-level totals after the change
        totals: DraftTotals,
    },

    /// Settlement persisted
    SettlementCreated {
        /// Server-assigned settlement ID
        settlement_id: SettlementId,
    },

    /// Preview or create failed
    OperationFailed {
        /// Taxonomy bucket
        kind: FailureKind,
        /// Operator-facing message
        message: String,
    },
}

/// Broadcast bus for reconciler events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ReconcilerEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcilerEvent> {
        self.sender.subscribe()
    }

    /// Publish; no subscribers is not an error
    pub fn publish(&self, event: ReconcilerEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}
