//! Configuration for the settlement reconciler

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Paging and prefetch configuration
    pub paging: PagingConfig,

    /// Busy indicator configuration
    pub indicator: IndicatorConfig,

    /// Event channel configuration
    pub events: EventConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "settlement-reconciler".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            paging: PagingConfig::default(),
            indicator: IndicatorConfig::default(),
            events: EventConfig::default(),
        }
    }
}

/// Paging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Pages loaded per handle when a draft is created
    pub initial_pages: u32,

    /// Pages prefetched ahead of the one being viewed
    pub prefetch_ahead: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            initial_pages: 3,
            prefetch_ahead: 2,
        }
    }
}

/// Busy indicator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// Minimum time the "generating" indicator stays visible (milliseconds)
    pub min_visible_ms: u64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            min_visible_ms: 800,
        }
    }
}

impl IndicatorConfig {
    /// Minimum visible duration
    pub fn min_visible(&self) -> Duration {
        Duration::from_millis(self.min_visible_ms)
    }
}

/// Event channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast buffer per subscriber
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(pages) = std::env::var("RECONCILER_INITIAL_PAGES") {
            config.paging.initial_pages = parse_env("RECONCILER_INITIAL_PAGES", &pages)?;
        }

        if let Ok(ahead) = std::env::var("RECONCILER_PREFETCH_AHEAD") {
            config.paging.prefetch_ahead = parse_env("RECONCILER_PREFETCH_AHEAD", &ahead)?;
        }

        if let Ok(ms) = std::env::var("RECONCILER_MIN_VISIBLE_MS") {
            config.indicator.min_visible_ms = parse_env("RECONCILER_MIN_VISIBLE_MS", &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the reconciler cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.paging.initial_pages == 0 {
            return Err(crate::Error::Config(
                "paging.initial_pages must be at least 1".to_string(),
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(crate::Error::Config(
                "events.channel_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}={}: {}", name, value, e)))
}
