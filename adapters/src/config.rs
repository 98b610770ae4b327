//! Configuration for the billing API backend

use crate::{retry::RetryConfig, Error, Result};
use serde::{Deserialize, Serialize};

/// HTTP backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    /// Billing API base URL, without trailing slash
    pub base_url: String,

    /// Bearer token
    pub api_token: Option<String>,

    /// Request timeout (seconds)
    pub timeout_seconds: u64,

    /// Retry policy for page fetches
    pub retry: RetryConfig,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_token: None,
            timeout_seconds: crate::DEFAULT_REQUEST_TIMEOUT_SECONDS,
            retry: RetryConfig::default(),
        }
    }
}

impl HttpBackendConfig {
    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("BILLING_API_URL") {
            config.base_url = url;
        }

        if let Ok(token) = std::env::var("BILLING_API_TOKEN") {
            config.api_token = Some(token);
        }

        if let Ok(timeout) = std::env::var("BILLING_API_TIMEOUT_SECS") {
            config.timeout_seconds = timeout
                .parse()
                .map_err(|e| Error::Config(format!("BILLING_API_TIMEOUT_SECS={}: {}", timeout, e)))?;
        }

        if let Ok(retries) = std::env::var("BILLING_API_MAX_RETRIES") {
            config.retry.max_retries = retries
                .parse()
                .map_err(|e| Error::Config(format!("BILLING_API_MAX_RETRIES={}: {}", retries, e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }

        if self.timeout_seconds == 0 {
            return Err(Error::Config("timeout_seconds must be at least 1".to_string()));
        }

        Ok(())
    }

    /// Base URL without trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Configuration file for the preview CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine settings
    pub reconciler: reconciler::Config,

    /// Billing API settings
    pub backend: HttpBackendConfig,
}

impl AppConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.backend.validate()?;
        config
            .reconciler
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load both sections from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            reconciler: reconciler::Config::from_env().map_err(|e| Error::Config(e.to_string()))?,
            backend: HttpBackendConfig::from_env()?,
        })
    }
}
