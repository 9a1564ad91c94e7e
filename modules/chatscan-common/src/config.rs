use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;
use typed_builder::TypedBuilder;

use crate::error::{ChatScanError, Result};

const DEFAULT_NAVIGATION_SETTLE: Duration = Duration::from_secs(2);

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Remote browser
    pub browserless_url: String,
    pub browserless_token: Option<String>,

    /// Page to open before discovery. When unset the current page is used.
    pub target_url: Option<String>,
    /// Wait after navigating to `target_url` before discovery starts.
    pub navigation_settle: Duration,

    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            browserless_url: required(&lookup, "BROWSERLESS_URL")?,
            browserless_token: optional(&lookup, "BROWSERLESS_TOKEN"),
            target_url: optional(&lookup, "CHATSCAN_TARGET_URL"),
            navigation_settle: millis(&lookup, "CHATSCAN_NAVIGATION_SETTLE_MS", DEFAULT_NAVIGATION_SETTLE)?,
            discovery: DiscoveryConfig::from_lookup(&lookup)?,
        })
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            browserless_url = self.browserless_url.as_str(),
            browserless_token = if self.browserless_token.is_some() { "[set]" } else { "[unset]" },
            target_url = self.target_url.as_deref().unwrap_or("(current page)"),
            navigation_settle_ms = self.navigation_settle.as_millis() as u64,
            "Loaded configuration"
        );
        info!(
            store_init_attempts = self.discovery.store_init_attempts,
            network_host = self.discovery.network_host.as_str(),
            dom_stuck_batches = self.discovery.dom_stuck_batches,
            dom_max_scroll_iterations = self.discovery.dom_max_scroll_iterations,
            max_batch_iterations = self.discovery.max_batch_iterations,
            "Discovery thresholds"
        );
    }
}

/// Retry, wait and convergence thresholds for the discovery pipeline.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DiscoveryConfig {
    // State store
    #[builder(default = 5)]
    pub store_init_attempts: u32,
    #[builder(default = Duration::from_secs(1))]
    pub store_initial_backoff: Duration,
    #[builder(default = 1.5)]
    pub store_backoff_factor: f64,

    // Network interception
    #[builder(default = 5)]
    pub network_wait_checks: u32,
    #[builder(default = Duration::from_secs(1))]
    pub network_wait_interval: Duration,
    #[builder(default = "web.whatsapp.com".to_string(), setter(into))]
    pub network_host: String,
    #[builder(default = vec!["chat".into(), "conversation".into(), "whatsapp".into()])]
    pub network_keywords: Vec<String>,

    // DOM scraping
    #[builder(default = Duration::from_secs(5))]
    pub dom_container_timeout: Duration,
    #[builder(default = 5)]
    pub dom_scrolls_per_batch: u32,
    #[builder(default = Duration::from_millis(1500))]
    pub dom_scroll_settle: Duration,
    #[builder(default = Duration::from_millis(500))]
    pub dom_idle_wait: Duration,
    #[builder(default = 5)]
    pub dom_bottom_quiet_batches: u32,
    #[builder(default = 10)]
    pub dom_stuck_batches: u32,
    #[builder(default = 100)]
    pub dom_max_scroll_iterations: u32,

    // Orchestrator
    #[builder(default = 100)]
    pub max_batch_iterations: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DiscoveryConfig {
    /// Default thresholds with every wait set to zero.
    pub fn without_delays() -> Self {
        Self::builder()
            .store_initial_backoff(Duration::ZERO)
            .network_wait_interval(Duration::ZERO)
            .dom_container_timeout(Duration::ZERO)
            .dom_scroll_settle(Duration::ZERO)
            .dom_idle_wait(Duration::ZERO)
            .build()
    }

    /// Delay before retry number `attempt` (zero-based) of the store probe.
    pub fn store_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.store_initial_backoff.as_secs_f64() * self.store_backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let backoff_factor: f64 = parsed(
            lookup,
            "CHATSCAN_STORE_BACKOFF_FACTOR",
            defaults.store_backoff_factor,
        )?;
        if !(1.0..=10.0).contains(&backoff_factor) {
            return Err(ChatScanError::Config(format!(
                "CHATSCAN_STORE_BACKOFF_FACTOR must be between 1 and 10, got {backoff_factor}"
            )));
        }

        let network_keywords = match optional(lookup, "CHATSCAN_NETWORK_KEYWORDS") {
            Some(raw) => raw
                .split(',')
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            None => defaults.network_keywords,
        };

        Ok(Self {
            store_init_attempts: parsed(
                lookup,
                "CHATSCAN_STORE_INIT_ATTEMPTS",
                defaults.store_init_attempts,
            )?
            .max(1),
            store_initial_backoff: millis(
                lookup,
                "CHATSCAN_STORE_INITIAL_BACKOFF_MS",
                defaults.store_initial_backoff,
            )?,
            store_backoff_factor: backoff_factor,
            network_wait_checks: parsed(
                lookup,
                "CHATSCAN_NETWORK_WAIT_CHECKS",
                defaults.network_wait_checks,
            )?,
            network_wait_interval: millis(
                lookup,
                "CHATSCAN_NETWORK_WAIT_INTERVAL_MS",
                defaults.network_wait_interval,
            )?,
            network_host: optional(lookup, "CHATSCAN_NETWORK_HOST")
                .unwrap_or(defaults.network_host),
            network_keywords,
            dom_container_timeout: millis(
                lookup,
                "CHATSCAN_DOM_CONTAINER_TIMEOUT_MS",
                defaults.dom_container_timeout,
            )?,
            dom_scrolls_per_batch: parsed(
                lookup,
                "CHATSCAN_DOM_SCROLLS_PER_BATCH",
                defaults.dom_scrolls_per_batch,
            )?,
            dom_scroll_settle: millis(
                lookup,
                "CHATSCAN_DOM_SCROLL_SETTLE_MS",
                defaults.dom_scroll_settle,
            )?,
            dom_idle_wait: millis(lookup, "CHATSCAN_DOM_IDLE_WAIT_MS", defaults.dom_idle_wait)?,
            dom_bottom_quiet_batches: parsed(
                lookup,
                "CHATSCAN_DOM_BOTTOM_QUIET_BATCHES",
                defaults.dom_bottom_quiet_batches,
            )?,
            dom_stuck_batches: parsed(
                lookup,
                "CHATSCAN_DOM_STUCK_BATCHES",
                defaults.dom_stuck_batches,
            )?,
            dom_max_scroll_iterations: parsed(
                lookup,
                "CHATSCAN_DOM_MAX_SCROLL_ITERATIONS",
                defaults.dom_max_scroll_iterations,
            )?,
            max_batch_iterations: parsed(
                lookup,
                "CHATSCAN_MAX_BATCH_ITERATIONS",
                defaults.max_batch_iterations,
            )?
            .max(1),
        })
    }
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    optional(lookup, key)
        .ok_or_else(|| ChatScanError::Config(format!("{key} environment variable is required")))
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match optional(lookup, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ChatScanError::Config(format!("{key} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parsed(lookup, key, default_ms).map(Duration::from_millis)
}
