//! Reconciler state machine
//!
//! ```text
//! Idle ──preview──▶ Previewing ──ok──▶ Ready ──confirm──▶ Generating ──ok──▶ Created
//!   ▲                   │                ▲  │                  │
//!   │                 error              │  └──re-preview──┐   error
//!   │                   ▼                │                 ▼   ▼
//!   └────────────────Failed ─────────────┘            Previewing
//! ```
//!
//! `Failed` is transient: the reconciler records the failure and settles in
//! `Ready` when a draft survived, `Idle` otherwise.

use crate::{error::FailureKind, types::SettlementId, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reconciler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcilerState {
    /// No draft; waiting for complete filters
    Idle,
    /// Preview request in flight
    Previewing,
    /// Draft available for browsing and exclusion
    Ready,
    /// Create request in flight
    Generating,
    /// Settlement persisted
    Created(SettlementId),
    /// Last operation failed
    Failed(FailureKind),
}

impl ReconcilerState {
    /// Short name, for messages
    pub fn name(&self) -> &'static str {
        match self {
            ReconcilerState::Idle => "Idle",
            ReconcilerState::Previewing => "Previewing",
            ReconcilerState::Ready => "Ready",
            ReconcilerState::Generating => "Generating",
            ReconcilerState::Created(_) => "Created",
            ReconcilerState::Failed(_) => "Failed",
        }
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: &ReconcilerState) -> bool {
        use ReconcilerState::*;

        matches!(
            (self, next),
            (Idle | Ready | Created(_) | Failed(_), Previewing)
                | (Previewing, Ready)
                | (Previewing, Failed(_))
                | (Ready, Generating)
                | (Generating, Created(_))
                | (Generating, Failed(_))
                | (Failed(_), Ready)
                | (Ready | Created(_) | Failed(_), Idle)
        )
    }

    /// Move to `next` if legal
    pub fn transition(&mut self, next: ReconcilerState) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.name().to_string(),
                to: next.name().to_string(),
            });
        }

        debug!("State {} -> {}", self.name(), next.name());
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcilerState::Created(id) => write!(f, "Created({})", id),
            ReconcilerState::Failed(kind) => write!(f, "Failed({})", kind),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// In-flight state that reverts to a fallback if abandoned.
///
/// Holding a `Transition` across an `.await` means a dropped future cannot
/// leave the reconciler stuck in `Previewing` or `Generating`.
#[derive(Debug)]
pub struct Transition<'a> {
    state: &'a mut ReconcilerState,
    fallback: ReconcilerState,
    settled: bool,
}

impl<'a> Transition<'a> {
    /// Enter `in_flight`, remembering where to land if abandoned
    pub fn begin(
        state: &'a mut ReconcilerState,
        in_flight: ReconcilerState,
        fallback: ReconcilerState,
    ) -> Result<Self> {
        state.transition(in_flight)?;
        Ok(Self {
            state,
            fallback,
            settled: false,
        })
    }

    /// Leave the in-flight state for `next`
    pub fn settle(mut self, next: ReconcilerState) -> Result<()> {
        self.settled = true;
        self.state.transition(next)
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                "{} abandoned, falling back to {}",
                self.state.name(),
                self.fallback.name()
            );
            *self.state = self.fallback;
        }
    }
}
