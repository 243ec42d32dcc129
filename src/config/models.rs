//! Configuration data structures for conduit.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise. All
//! durations are expressed in milliseconds and exposed as `Duration` through accessors.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Connection pool limits.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum pooled connections (idle + active) per destination
    pub max_connections_per_destination: usize,
    /// Maximum pooled connections across all destinations
    pub max_total_connections: usize,
    /// Connections older than this are closed on release instead of requeued
    pub keep_alive_ms: u64,
    /// Idle connections unused for longer than this are closed by the sweep
    pub max_idle_ms: u64,
    /// Ask the remote for compressed responses
    pub compression: bool,
    /// Timeout for establishing a new connection
    pub connect_timeout_ms: u64,
    /// How often the idle sweep runs
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_destination: 10,
            max_total_connections: 100,
            keep_alive_ms: 30_000,
            max_idle_ms: 60_000,
            compression: true,
            connect_timeout_ms: 10_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Retry policy applied by the retry executor.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Upper bound for any single backoff delay (before jitter)
    pub max_delay_ms: u64,
    /// Growth factor applied per additional attempt
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as +/- jitter, in [0, 1]
    pub jitter_factor: f64,
    pub retry_on_network_error: bool,
    pub retry_on_timeout: bool,
    pub retry_on_server_error: bool,
    pub retry_on_rate_limit: bool,
    /// Extra status codes treated as retryable regardless of class
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retry_on_network_error: true,
            retry_on_timeout: true,
            retry_on_server_error: true,
            retry_on_rate_limit: true,
            retryable_status_codes: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Decide whether an error may be retried under this policy.
    pub fn is_retryable(&self, error: &GatewayError) -> bool {
        if let Some(status) = error.status_code() {
            if self.retryable_status_codes.contains(&status) {
                return true;
            }
        }

        match error {
            GatewayError::Network(_) => self.retry_on_network_error,
            GatewayError::Timeout(_) => self.retry_on_timeout,
            GatewayError::Server { .. } => self.retry_on_server_error,
            GatewayError::RateLimited { .. } => self.retry_on_rate_limit,
            _ => false,
        }
    }
}

/// Per-dependency circuit breaker thresholds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that trip the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before letting probes through
    pub recovery_timeout_ms: u64,
    /// Percentage (0, 100] of half-open calls allowed through as probes
    pub half_open_request_percent: f64,
    /// Probe successes required to close a half-open breaker
    pub success_threshold: u32,
    /// Sliding window for counting failures
    pub failure_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_request_percent: 50.0,
            success_threshold: 3,
            failure_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

/// In-flight deduplication and telemetry settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Unresolved in-flight entries older than this are treated as absent
    pub in_flight_ttl_ms: u64,
    /// How often expired in-flight entries are failed and purged
    pub sweep_interval_ms: u64,
    /// Samples kept per dependency
    pub metrics_history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            in_flight_ttl_ms: 5 * 60 * 1_000,
            sweep_interval_ms: 2 * 60 * 1_000,
            metrics_history_limit: 1_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn in_flight_ttl(&self) -> Duration {
        Duration::from_millis(self.in_flight_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Default function for provider enabled flag
fn default_provider_enabled() -> bool {
    true
}

/// Default request path for the generic HTTP provider
fn default_provider_path() -> String {
    "/".to_string()
}

/// Per-provider settings handed to its factory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Base URL the provider's connections are pooled against
    pub destination: String,
    /// Path appended to the destination for requests
    #[serde(default = "default_provider_path")]
    pub path: String,
    /// Model name prefixes routed to this provider
    #[serde(default)]
    pub model_prefixes: Vec<String>,
    /// Capability tags the provider serves
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_provider_enabled")]
    pub enabled: bool,
    /// Opaque adapter-specific settings
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            path: default_provider_path(),
            model_prefixes: Vec::new(),
            capabilities: Vec::new(),
            enabled: true,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_model_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// Top-level configuration consumed once when the dispatcher starts.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub coordinator: CoordinatorConfig,
    /// Providers keyed by dependency id (iterated in key order)
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl GatewayConfig {
    /// Create a new configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = circuit_breaker;
        self
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.config.coordinator = coordinator;
        self
    }

    pub fn provider(mut self, id: impl Into<String>, provider: ProviderConfig) -> Self {
        self.config.providers.insert(id.into(), provider);
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.pool.max_connections_per_destination, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.coordinator.in_flight_ttl(), Duration::from_secs(300));
        assert_eq!(config.coordinator.sweep_interval(), Duration::from_secs(120));
        assert_eq!(config.coordinator.metrics_history_limit, 1_000);
    }

    #[test]
    fn test_retryable_classes_follow_toggles() {
        let mut retry = RetryConfig::default();
        let timeout = GatewayError::Timeout("deadline".into());
        let limited = GatewayError::from_status(429, "limited");
        let server = GatewayError::from_status(503, "down");

        assert!(retry.is_retryable(&timeout));
        assert!(retry.is_retryable(&limited));
        assert!(retry.is_retryable(&server));

        retry.retry_on_timeout = false;
        retry.retry_on_rate_limit = false;
        assert!(!retry.is_retryable(&timeout));
        assert!(!retry.is_retryable(&limited));
        assert!(retry.is_retryable(&server));
    }

    #[test]
    fn test_extra_status_codes_are_retryable() {
        let mut retry = RetryConfig::default();
        let conflict = GatewayError::from_status(409, "conflict");
        assert!(!retry.is_retryable(&conflict));

        retry.retryable_status_codes = vec![409];
        assert!(retry.is_retryable(&conflict));

        retry.retry_on_server_error = false;
        retry.retryable_status_codes = vec![503];
        assert!(retry.is_retryable(&GatewayError::from_status(503, "down")));
        assert!(!retry.is_retryable(&GatewayError::from_status(500, "boom")));
    }

    #[test]
    fn test_usage_errors_never_retryable() {
        let retry = RetryConfig::default();
        assert!(!retry.is_retryable(&GatewayError::Usage("bad".into())));
        assert!(!retry.is_retryable(&GatewayError::Operation("bad".into())));
    }

    #[test]
    fn test_builder() {
        let config = GatewayConfig::builder()
            .provider(
                "openai",
                ProviderConfig::new("https://api.openai.com")
                    .with_model_prefixes(["gpt-"])
                    .with_capabilities(["chat"]),
            )
            .build();

        let provider = &config.providers["openai"];
        assert_eq!(provider.model_prefixes, vec!["gpt-".to_string()]);
        assert_eq!(provider.path, "/");
        assert!(provider.enabled);
    }
}
