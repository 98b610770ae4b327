//! # Billing Adapters
//!
//! Connects the settlement reconciler to the billing API:
//! - `SettlementBackend` over HTTP with bearer auth and request timeouts
//! - Exponential backoff with jitter for page fetches
//! - Error envelopes mapped into the reconciler's failure taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         SettlementReconciler (engine)       │
//! └──────────────────────┬──────────────────────┘
//!                        │ SettlementBackend
//! ┌──────────────────────▼──────────────────────┐
//! │           HttpSettlementBackend             │
//! │   preview  │  page (+ retry)  │  create     │
//! └──────────────────────┬──────────────────────┘
//!                        │ HTTPS / JSON
//! ┌──────────────────────▼──────────────────────┐
//! │                Billing API                  │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod error;
pub mod http;
pub mod retry;
pub mod wire;

pub use config::{AppConfig, HttpBackendConfig};
pub use error::{Error, Result};
pub use http::HttpSettlementBackend;
pub use retry::{RetryConfig, RetryStrategy};

/// Default request timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
