//! Settlement Reconciler
//!
//! Builds insurer settlements from server-computed previews: the operator
//! pages through billable services, excludes the ones that must not be
//! billed, and confirms. Exclusions are local and instantaneous; the only
//! thing sent on creation is the preview's settlement key plus the excluded
//! service IDs.
//!
//! # Architecture

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

//!
//! 1. **Preview**: filters are validated and sent; the response carries one
//!    baseline per agreement and a handle for its paginated rows
//! 2. **Hydration**: the first pages of every agreement are fetched into a
//!    page cache that belongs to the new draft alone
//! 3. **Reconciliation**: exclusions go into a per-handle ledger and every
//!    change triggers a pure recompute of the affected aggregate
//! 4. **Creation**: the union of excluded IDs and the settlement key are
//!    submitted; a failure keeps the draft and its exclusions intact
//!
//! # Example
//!
//! ```no_run
//! use reconciler::{
//!     memory::InMemoryBackend, Config, InsurerId, SettlementFilters, SettlementReconciler,
//! };
//! use chrono::NaiveDate;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> reconciler::Result<()> {
//!     let backend = Arc::new(InMemoryBackend::new());
//!     let mut reconciler = SettlementReconciler::new(backend, Config::default());
//!
//!     let filters = SettlementFilters::simple(
//!         InsurerId(7),
//!         NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
//!         NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
//!     );
//!     let draft = reconciler.preview(&filters).await?;
//!     println!("{} services, total {}", draft.total_included_count, draft.total_amount);
//!
//!     let settlement_id = reconciler.confirm_and_create().await?;
//!     println!("Created settlement {}", settlement_id);
//!
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod exclusion;
pub mod filters;
pub mod indicator;
pub mod memory;
pub mod page_cache;
pub mod prefetch;
pub mod reconciler;
pub mod rules;
pub mod state;
pub mod types;

// Re-exports
pub use aggregate::AggregateUpdate;
pub use backend::{CreateSettlementRequest, PreviewResponse, SettlementBackend};
pub use config::Config;
pub use error::{Error, FailureKind, Result};
pub use events::ReconcilerEvent;
pub use filters::{PreviewRequest, SettlementFilters};
pub use reconciler::{Failure, PageState, PageView, SettlementReconciler};
pub use rules::{PlanRuleSet, QuantityRule};
pub use state::ReconcilerState;
pub use types::*;
