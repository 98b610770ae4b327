//! Billing API backend over HTTP
//!
//! - `POST {base}/settlements/preview` computes a preview
//! - `GET {base}/settlements/provided-services/{baseKey}?page=n` serves a page
//! - `POST {base}/settlements` persists a settlement
//!
//! Page fetches are idempotent and retried with backoff. Creation is never
//! retried here; the operator confirms again instead.

use crate::{
    config::HttpBackendConfig,
    retry::RetryStrategy,
    wire::{CreatedEnvelope, ErrorEnvelope, PageEnvelope},
    Error, Result,
};
use async_trait::async_trait;
use reconciler::{
    CacheHandle, CreateSettlementRequest, PreviewRequest, PreviewResponse, ProvidedServiceRow,
    SettlementBackend, SettlementId,
};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use std::time::Duration;
use tracing::{debug, info};

/// Billing API client implementing [`SettlementBackend`]
#[derive(Debug)]
pub struct HttpSettlementBackend {
    config: HttpBackendConfig,
    client: Client,
    retry: RetryStrategy,
}

impl HttpSettlementBackend {
    /// Create new backend
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        let retry = RetryStrategy::new(config.retry.clone());

        Ok(Self {
            config,
            client,
            retry,
        })
    }

    /// Request a preview
    pub async fn preview(&self, request: &PreviewRequest) -> Result<PreviewResponse> {
        info!(
            "Requesting {} preview for insurer {}",
            request.settlement_type, request.insurer_id
        );

        let url = self.url(&["settlements", "preview"])?;
        let response = self
            .send(self.request(Method::POST, url).json(request), "preview")
            .await?;

        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        let (status_code, envelope) = Self::read_error(response).await;
        if envelope.is_no_active_plans() {
            return Err(Error::NoActivePlans {
                insurer_id: request.insurer_id.0,
                message: envelope.message,
            });
        }

        Err(Error::BillingApi {
            status_code,
            code: envelope.code,
            message: envelope.message,
        })
    }

    /// Fetch one page, retrying transient failures
    pub async fn page(&self, handle: &CacheHandle, page_index: u32) -> Result<Vec<ProvidedServiceRow>> {
        let operation = format!("page {}#{}", handle, page_index);

        self.retry
            .execute(
                || async {
                    debug!("Fetching {}", operation);
                    let url = self.url(&["settlements", "provided-services", handle.as_str()])?;
                    let request = self
                        .request(Method::GET, url)
                        .query(&[("page", page_index)]);

                    let response = self.check(self.send(request, &operation).await?).await?;
                    let envelope: PageEnvelope = response.json().await?;
                    Ok::<_, Error>(envelope.content)
                },
                &operation,
            )
            .await
    }

    /// Persist a settlement
    pub async fn create(&self, request: &CreateSettlementRequest) -> Result<SettlementId> {
        info!(
            "Creating settlement from {} excluding {} services",
            request.settlement_key,
            request.excluded_provided_services_ids.len()
        );

        let url = self.url(&["settlements"])?;
        let response = self
            .send(self.request(Method::POST, url).json(request), "create")
            .await?;
        let created: CreatedEnvelope = self.check(response).await?.json().await?;

        Ok(created.id)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(self.config.base())
            .map_err(|e| Error::Config(format!("Invalid base_url: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("base_url {} cannot have a path", self.config.base())))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    seconds: self.config.timeout_seconds,
                    operation: operation.to_string(),
                }
            } else {
                Error::Connection(e.to_string())
            }
        })
    }

    async fn check(&self, response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let (status_code, envelope) = Self::read_error(response).await;
        Err(Error::BillingApi {
            status_code,
            code: envelope.code,
            message: envelope.message,
        })
    }

    async fn read_error(response: Response) -> (u16, ErrorEnvelope) {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        (status, ErrorEnvelope::parse(&body))
    }
}

#[async_trait]
impl SettlementBackend for HttpSettlementBackend {
    async fn preview_settlement(&self, request: &PreviewRequest) -> reconciler::Result<PreviewResponse> {
        Ok(self.preview(request).await?)
    }

    async fn fetch_page(
        &self,
        handle: &CacheHandle,
        page_index: u32,
    ) -> reconciler::Result<Vec<ProvidedServiceRow>> {
        Ok(self.page(handle, page_index).await?)
    }

    async fn create_settlement(
        &self,
        request: &CreateSettlementRequest,
    ) -> reconciler::Result<SettlementId> {
        Ok(self.create(request).await?)
    }

    fn name(&self) -> &str {
        "billing-api"
    }
}
