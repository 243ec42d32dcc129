//! Generic JSON-over-HTTP dependency.
//!
//! Posts the request descriptor as JSON to `destination + path` and maps the
//! HTTP outcome onto [`GatewayError`]. No payload translation happens here.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{WrapErr, eyre};
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde_json::Value;
use url::Url;

use crate::{
    config::ProviderConfig,
    core::request::{ProviderResponse, RequestDescriptor},
    error::{GatewayError, GatewayResult},
    ports::{Provider, ProviderFactory, SharedProvider},
};

/// Longest error body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// Parse a `Retry-After` value (delta seconds or HTTP date) into milliseconds.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).num_milliseconds().max(0) as u64)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Map a non-success response onto the error taxonomy.
pub fn error_for_status(status: u16, retry_after: Option<&str>, body: &str) -> GatewayError {
    let message = if body.trim().is_empty() {
        StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("no response body")
            .to_string()
    } else {
        truncate(body.trim()).to_string()
    };

    match GatewayError::from_status(status, message) {
        GatewayError::RateLimited { message, .. } => GatewayError::RateLimited {
            message,
            retry_after_ms: retry_after.and_then(|v| parse_retry_after(v, Utc::now())),
        },
        other => other,
    }
}

/// Pass-through provider posting JSON to one endpoint.
#[derive(Debug)]
pub struct HttpJsonProvider {
    id: String,
    destination: String,
    endpoint: Url,
    capabilities: Vec<String>,
    request_timeout: Option<Duration>,
}

impl HttpJsonProvider {
    /// Build from provider configuration.
    ///
    /// Recognized settings: `timeout_ms` (per-attempt request timeout).
    pub fn from_config(id: &str, config: &ProviderConfig) -> eyre::Result<Self> {
        let base = Url::parse(&config.destination)
            .wrap_err_with(|| format!("Invalid destination for provider '{id}'"))?;
        let endpoint = base
            .join(&config.path)
            .wrap_err_with(|| format!("Invalid path '{}' for provider '{id}'", config.path))?;

        let request_timeout = match config.settings.get("timeout_ms") {
            None => None,
            Some(value) => Some(Duration::from_millis(value.as_u64().ok_or_else(|| {
                eyre!("Setting 'timeout_ms' for provider '{id}' must be a positive integer")
            })?)),
        };

        Ok(Self {
            id: id.to_string(),
            destination: config.destination.clone(),
            endpoint,
            capabilities: config.capabilities.clone(),
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Provider<Client> for HttpJsonProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn execute(
        &self,
        request: &RequestDescriptor,
        connection: &Client,
    ) -> GatewayResult<ProviderResponse> {
        let mut builder = connection.post(self.endpoint.clone()).json(request);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            tracing::debug!(
                dependency = %self.id,
                status = status.as_u16(),
                "Dependency returned an error status"
            );
            return Err(error_for_status(
                status.as_u16(),
                retry_after.as_deref(),
                &body,
            ));
        }

        let body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Ok(ProviderResponse::new(&self.id, &request.target, body).with_bytes(bytes.len() as u64))
    }
}

/// Factory building an [`HttpJsonProvider`] from each provider config.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpJsonProviderFactory;

impl ProviderFactory<Client> for HttpJsonProviderFactory {
    fn create(&self, id: &str, config: &ProviderConfig) -> eyre::Result<SharedProvider<Client>> {
        let provider = HttpJsonProvider::from_config(id, config)?;
        tracing::debug!(dependency = id, endpoint = %provider.endpoint, "Created HTTP provider");
        Ok(Arc::new(provider))
    }
}
