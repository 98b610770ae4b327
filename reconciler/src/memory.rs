//! In-memory backend
//!
//! Serves previews and pages from agreements registered up front. Used by
//! tests and local demos; supports latency and failure injection and records
//! every request it receives.

use crate::{
    backend::{CreateSettlementRequest, PreviewResponse, SettlementBackend},
    filters::PreviewRequest,
    types::*,
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// One agreement's services
#[derive(Debug, Clone)]
pub struct MemoryAgreement {
    /// Plan name
    pub plan_name: String,
    /// Agreement validity label
    pub coverage_period_label: String,
    /// Handle the agreement's pages are served under
    pub base_key: CacheHandle,
    /// Agreement-level fee
    pub fee: Decimal,
    /// Every service, in page order
    pub rows: Vec<ProvidedServiceRow>,
}

impl MemoryAgreement {
    /// Create an agreement with no fee
    pub fn new(plan_name: impl Into<String>, base_key: impl Into<String>, rows: Vec<ProvidedServiceRow>) -> Self {
        Self {
            plan_name: plan_name.into(),
            coverage_period_label: "current".to_string(),
            base_key: CacheHandle::new(base_key),
            fee: Decimal::ZERO,
            rows,
        }
    }

    fn baseline(&self, page_size: usize) -> AgreementBaseline {
        AgreementBaseline {
            plan_name: self.plan_name.clone(),
            coverage_period_label: self.coverage_period_label.clone(),
            cache_handle: self.base_key.clone(),
            page_count: self.rows.len().div_ceil(page_size) as u32,
            protocols: self.rows.len() as u64,
            fee: self.fee,
            subtotal: self.rows.iter().map(ProvidedServiceRow::net_amount).sum(),
        }
    }
}

#[derive(Debug)]
struct MemoryState {
    insurers: HashMap<InsurerId, Vec<MemoryAgreement>>,
    page_size: usize,
    page_latency: Duration,
    preview_latency: Duration,
    transport_down: bool,
    page_failures: HashMap<(CacheHandle, u32), u32>,
    create_failures: u32,
    previews: u64,
    next_settlement_id: i64,
    preview_requests: Vec<PreviewRequest>,
    page_requests: Vec<(CacheHandle, u32)>,
    create_requests: Vec<CreateSettlementRequest>,
}

/// In-memory settlement backend
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Create an empty backend with pages of 10 rows
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                insurers: HashMap::new(),
                page_size: 10,
                page_latency: Duration::ZERO,
                preview_latency: Duration::ZERO,
                transport_down: false,
                page_failures: HashMap::new(),
                create_failures: 0,
                previews: 0,
                next_settlement_id: 1000,
                preview_requests: Vec::new(),
                page_requests: Vec::new(),
                create_requests: Vec::new(),
            }),
        }
    }

    /// Set rows per page
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = page_size.max(1);
        self
    }

    /// Register an agreement for an insurer
    pub fn with_agreement(self, insurer_id: InsurerId, agreement: MemoryAgreement) -> Self {
        self.state
            .lock()
            .insurers
            .entry(insurer_id)
            .or_default()
            .push(agreement);
        self
    }

    /// Delay every page response
    pub fn set_page_latency(&self, latency: Duration) {
        self.state.lock().page_latency = latency;
    }

    /// Delay every preview response
    pub fn set_preview_latency(&self, latency: Duration) {
        self.state.lock().preview_latency = latency;
    }

    /// Make preview and create fail with a transport error
    pub fn set_transport_down(&self, down: bool) {
        self.state.lock().transport_down = down;
    }

    /// Fail the next `times` fetches of one page
    pub fn fail_page(&self, handle: &CacheHandle, page_index: u32, times: u32) {
        self.state
            .lock()
            .page_failures
            .insert((handle.clone(), page_index), times);
    }

    /// Fail the next `times` create requests
    pub fn fail_next_creates(&self, times: u32) {
        self.state.lock().create_failures = times;
    }

    /// Preview requests received
    pub fn preview_requests(&self) -> Vec<PreviewRequest> {
        self.state.lock().preview_requests.clone()
    }

    /// Page requests received, in arrival order
    pub fn page_requests(&self) -> Vec<(CacheHandle, u32)> {
        self.state.lock().page_requests.clone()
    }

    /// Create requests received
    pub fn create_requests(&self) -> Vec<CreateSettlementRequest> {
        self.state.lock().create_requests.clone()
    }
}

#[async_trait]
impl SettlementBackend for InMemoryBackend {
    async fn preview_settlement(&self, request: &PreviewRequest) -> Result<PreviewResponse> {
        let latency = {
            let mut state = self.state.lock();
            state.preview_requests.push(request.clone());
            state.preview_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if state.transport_down {
            return Err(Error::Transport("backend unreachable".to_string()));
        }

        let page_size = state.page_size;
        let agreements: Vec<AgreementBaseline> = state
            .insurers
            .get(&request.insurer_id)
            .map(|agreements| agreements.iter().map(|a| a.baseline(page_size)).collect())
            .unwrap_or_default();

        if agreements.is_empty() {
            return Err(Error::NoActivePlans {
                insurer_id: request.insurer_id,
            });
        }

        state.previews += 1;
        let settlement_key =
            SettlementKey::new(format!("stl-{}-{}", request.insurer_id, state.previews));

        info!(
            "Previewed {} agreements for insurer {} as {}",
            agreements.len(),
            request.insurer_id,
            settlement_key
        );

        Ok(PreviewResponse {
            settlement_key,
            agreements,
        })
    }

    async fn fetch_page(
        &self,
        handle: &CacheHandle,
        page_index: u32,
    ) -> Result<Vec<ProvidedServiceRow>> {
        let latency = {
            let mut state = self.state.lock();
            state.page_requests.push((handle.clone(), page_index));
            state.page_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();

        if let Some(remaining) = state.page_failures.get_mut(&(handle.clone(), page_index)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Backend {
                    status: 503,
                    message: format!("page {} of {} temporarily unavailable", page_index, handle),
                });
            }
        }

        let page_size = state.page_size;
        let agreement = state
            .insurers
            .values()
            .flatten()
            .find(|a| &a.base_key == handle)
            .ok_or_else(|| Error::Backend {
                status: 404,
                message: format!("unknown base key {}", handle),
            })?;

        Ok(agreement
            .rows
            .iter()
            .skip(page_index as usize * page_size)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn create_settlement(&self, request: &CreateSettlementRequest) -> Result<SettlementId> {
        let mut state = self.state.lock();
        state.create_requests.push(request.clone());

        if state.transport_down {
            return Err(Error::Transport("backend unreachable".to_string()));
        }
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(Error::Transport("connection reset during create".to_string()));
        }

        state.next_settlement_id += 1;
        Ok(SettlementId(state.next_settlement_id))
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
