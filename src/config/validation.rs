use url::Url;

use crate::config::models::{
    CircuitBreakerConfig, CoordinatorConfig, GatewayConfig, PoolConfig, ProviderConfig,
    RetryConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid destination '{destination}' for provider '{provider}': {reason}")]
    InvalidDestination {
        provider: String,
        destination: String,
        reason: String,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire configuration, collecting every problem found
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        errors.extend(Self::validate_pool(&config.pool));
        errors.extend(Self::validate_retry(&config.retry));
        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_coordinator(&config.coordinator));

        for (id, provider) in &config.providers {
            errors.extend(Self::validate_provider(id, provider));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_pool(pool: &PoolConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if pool.max_connections_per_destination == 0 {
            errors.push(invalid(
                "pool.max_connections_per_destination",
                "must be greater than 0",
            ));
        }
        if pool.max_total_connections == 0 {
            errors.push(invalid("pool.max_total_connections", "must be greater than 0"));
        }
        if pool.max_connections_per_destination > pool.max_total_connections {
            errors.push(invalid(
                "pool.max_connections_per_destination",
                format!(
                    "{} exceeds max_total_connections ({})",
                    pool.max_connections_per_destination, pool.max_total_connections
                ),
            ));
        }
        if pool.keep_alive_ms == 0 {
            errors.push(invalid("pool.keep_alive_ms", "must be greater than 0"));
        }
        if pool.sweep_interval_ms == 0 {
            errors.push(invalid("pool.sweep_interval_ms", "must be greater than 0"));
        }

        errors
    }

    fn validate_retry(retry: &RetryConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if retry.max_attempts == 0 {
            errors.push(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(retry.backoff_multiplier >= 1.0) {
            errors.push(invalid(
                "retry.backoff_multiplier",
                format!("must be >= 1.0, got {}", retry.backoff_multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            errors.push(invalid(
                "retry.jitter_factor",
                format!("must be within [0, 1], got {}", retry.jitter_factor),
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            errors.push(invalid(
                "retry.initial_delay_ms",
                format!(
                    "{} exceeds max_delay_ms ({})",
                    retry.initial_delay_ms, retry.max_delay_ms
                ),
            ));
        }
        for code in &retry.retryable_status_codes {
            if !(100..=599).contains(code) {
                errors.push(invalid(
                    "retry.retryable_status_codes",
                    format!("{code} is not an HTTP status code"),
                ));
            }
        }

        errors
    }

    fn validate_circuit_breaker(breaker: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if breaker.failure_threshold == 0 {
            errors.push(invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if breaker.success_threshold == 0 {
            errors.push(invalid(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if !(breaker.half_open_request_percent > 0.0 && breaker.half_open_request_percent <= 100.0)
        {
            errors.push(invalid(
                "circuit_breaker.half_open_request_percent",
                format!(
                    "must be within (0, 100], got {}",
                    breaker.half_open_request_percent
                ),
            ));
        }
        if breaker.failure_window_ms == 0 {
            errors.push(invalid(
                "circuit_breaker.failure_window_ms",
                "must be greater than 0",
            ));
        }

        errors
    }

    fn validate_coordinator(coordinator: &CoordinatorConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if coordinator.in_flight_ttl_ms == 0 {
            errors.push(invalid("coordinator.in_flight_ttl_ms", "must be greater than 0"));
        }
        if coordinator.sweep_interval_ms == 0 {
            errors.push(invalid(
                "coordinator.sweep_interval_ms",
                "must be greater than 0",
            ));
        }
        if coordinator.metrics_history_limit == 0 {
            errors.push(invalid(
                "coordinator.metrics_history_limit",
                "must be greater than 0",
            ));
        }

        errors
    }

    fn validate_provider(id: &str, provider: &ProviderConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if id.trim().is_empty() {
            errors.push(invalid("providers", "provider ids must not be empty"));
        }

        match Url::parse(&provider.destination) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                if url.host_str().is_none() {
                    errors.push(ValidationError::InvalidDestination {
                        provider: id.to_string(),
                        destination: provider.destination.clone(),
                        reason: "missing host".to_string(),
                    });
                }
            }
            Ok(url) => errors.push(ValidationError::InvalidDestination {
                provider: id.to_string(),
                destination: provider.destination.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => errors.push(ValidationError::InvalidDestination {
                provider: id.to_string(),
                destination: provider.destination.clone(),
                reason: e.to_string(),
            }),
        }

        if !provider.path.starts_with('/') {
            errors.push(invalid(
                &format!("providers.{id}.path"),
                "must start with '/'",
            ));
        }

        if provider.model_prefixes.iter().any(|p| p.trim().is_empty()) {
            errors.push(invalid(
                &format!("providers.{id}.model_prefixes"),
                "prefixes must not be empty",
            ));
        }

        errors
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let count = errors.len();
        let details = errors
            .iter()
            .map(|e| format!("  - {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{count} configuration error(s):\n{details}")
    }
}
