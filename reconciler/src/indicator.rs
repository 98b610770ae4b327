//! Busy indicator with a minimum visible duration
//!
//! A fast preview must not flash the "generating" overlay for a few
//! milliseconds. Dismissal waits until the indicator has been visible for at
//! least the configured minimum.

use crate::events::{EventBus, ReconcilerEvent};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Indicator shown while a blocking request is in flight
#[derive(Debug)]
pub struct BusyIndicator {
    label: &'static str,
    shown_at: Instant,
    min_visible: Duration,
    events: EventBus,
}

impl BusyIndicator {
    /// Show the indicator now
    pub fn show(label: &'static str, min_visible: Duration, events: &EventBus) -> Self {
        events.publish(ReconcilerEvent::IndicatorShown { label });
        debug!("Showing '{}' indicator", label);

        Self {
            label,
            shown_at: Instant::now(),
            min_visible,
            events: events.clone(),
        }
    }

    /// Time still owed before the indicator may be dismissed
    pub fn remaining(&self) -> Duration {
        self.min_visible.saturating_sub(self.shown_at.elapsed())
    }

    /// Wait out the minimum, then dismiss. Returns how long it was visible.
    pub async fn dismiss(self) -> Duration {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }

        let visible_for = self.shown_at.elapsed();
        debug!("Dismissing '{}' indicator after {:?}", self.label, visible_for);
        self.events.publish(ReconcilerEvent::IndicatorDismissed {
            label: self.label,
            visible_for,
        });

        visible_for
    }
}
