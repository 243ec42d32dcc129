//! Request lifecycle orchestration.
//!
//! A [`Dispatcher`] owns one connection pool, one retry executor (with its
//! breaker registry), one request coordinator and one provider registry, and
//! drives a request through them:
//!
//! resolve dependency -> fingerprint -> coalesce -> pooled connection ->
//! retried execution -> release -> record performance -> complete in-flight
//!
//! A leader whose dispatch is dropped mid-flight still resolves its
//! registration: the waiters receive an abandonment error instead of waiting
//! for the in-flight TTL.
use std::{sync::Arc, time::Instant};

use serde::Serialize;
use tracing::{Instrument, debug, warn};

use super::{
    circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats},
    coordinator::{DependencyMetricsSnapshot, InFlight, InFlightTicket, RequestCoordinator},
    fingerprint::fingerprint_request,
    pool::{ConnectionPool, PoolStats},
    registry::{InitializationReport, ProviderRegistry, normalize_id},
    request::{ProviderResponse, RequestDescriptor},
    retry::{RetryExecutor, RetryStats},
};
use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    metrics,
    ports::{Connector, SharedProvider},
    tracing_setup,
    utils::{RandomSource, ThreadRandom},
};

/// Combined snapshot of every component
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub pool: PoolStats,
    pub retry: RetryStats,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub dependencies: Vec<DependencyMetricsSnapshot>,
    pub in_flight: usize,
}

/// Holds the leader role for one registration until it is completed.
struct LeaderGuard {
    coordinator: Arc<RequestCoordinator<ProviderResponse>>,
    ticket: Option<InFlightTicket>,
}

impl LeaderGuard {
    fn new(coordinator: Arc<RequestCoordinator<ProviderResponse>>, ticket: InFlightTicket) -> Self {
        Self {
            coordinator,
            ticket: Some(ticket),
        }
    }

    async fn complete(mut self, result: GatewayResult<ProviderResponse>) {
        if let Some(ticket) = self.ticket.clone() {
            self.coordinator.complete_registration(&ticket, result).await;
            // completing twice is a no-op, so a drop mid-await stays correct
            self.ticket = None;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let fingerprint = ticket.fingerprint().short().to_string();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                fingerprint = %fingerprint,
                "Leader dropped outside a runtime, entry left to expire"
            );
            return;
        };
        warn!(
            fingerprint = %fingerprint,
            "Leader dropped before completing, failing its waiters"
        );
        let coordinator = Arc::clone(&self.coordinator);
        runtime.spawn(async move {
            let error = GatewayError::Operation(format!(
                "in-flight request {fingerprint} was abandoned before completion"
            ));
            coordinator.complete_registration(&ticket, Err(error)).await;
        });
    }
}

/// Composes pool, retry executor, coordinator and registry.
pub struct Dispatcher<C: Connector> {
    config: GatewayConfig,
    pool: Arc<ConnectionPool<C>>,
    executor: RetryExecutor,
    coordinator: Arc<RequestCoordinator<ProviderResponse>>,
    registry: ProviderRegistry<C::Handle>,
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(config: GatewayConfig, connector: Arc<C>) -> Self {
        Self::with_random(config, connector, Arc::new(ThreadRandom))
    }

    /// Use `random` for retry jitter and half-open probe selection
    pub fn with_random(
        config: GatewayConfig,
        connector: Arc<C>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::with_random(
            config.circuit_breaker.clone(),
            Arc::clone(&random),
        ));
        Self {
            pool: Arc::new(ConnectionPool::new(connector)),
            executor: RetryExecutor::with_random(breakers, config.retry.clone(), random),
            coordinator: Arc::new(RequestCoordinator::new(config.coordinator.clone())),
            registry: ProviderRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.executor.breakers()
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator<ProviderResponse>> {
        &self.coordinator
    }

    pub fn registry(&self) -> &ProviderRegistry<C::Handle> {
        &self.registry
    }

    /// Initialize the pool, start background sweeps and create every
    /// configured dependency that has a registered factory.
    ///
    /// Register factories on [`registry`](Self::registry) before calling this.
    pub async fn start(&self) -> InitializationReport {
        self.pool.initialize(self.config.pool.clone());
        self.coordinator.start_sweeper();
        self.registry.initialize_all(&self.config.providers).await
    }

    async fn resolve(&self, request: &RequestDescriptor) -> GatewayResult<(String, SharedProvider<C::Handle>)> {
        let id = match &request.dependency_id {
            Some(id) => normalize_id(id),
            None => self
                .registry
                .get_provider_for_model(&request.target, Some(&self.config.providers))
                .await
                .ok_or_else(|| {
                    GatewayError::Usage(format!("no dependency serves target '{}'", request.target))
                })?,
        };

        let provider = match self.registry.get_provider(&id).await {
            Some(provider) => provider,
            None => match self.config.providers.get(&id) {
                Some(config) => self.registry.create_cached_provider(&id, config).await?,
                None => {
                    return Err(GatewayError::Usage(format!(
                        "dependency '{id}' is not available"
                    )));
                }
            },
        };

        if self.registry.is_healthy(&id).await == Some(false) {
            return Err(GatewayError::Usage(format!("dependency '{id}' is unhealthy")));
        }
        let capabilities = provider.capabilities();
        if !capabilities.is_empty()
            && !capabilities
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&request.capability))
        {
            return Err(GatewayError::Usage(format!(
                "dependency '{id}' does not serve capability '{}'",
                request.capability
            )));
        }
        Ok((id, provider))
    }

    /// Run one logical request through the full lifecycle.
    ///
    /// Identical concurrent requests share a single execution and all
    /// observe its terminal outcome.
    pub async fn dispatch(&self, request: RequestDescriptor) -> GatewayResult<ProviderResponse> {
        let span = tracing_setup::create_dispatch_span(&request.target, &request.capability);
        let recorder = span.clone();

        async move {
            let (id, provider) = self.resolve(&request).await?;
            recorder.record("dependency", id.as_str());
            let fingerprint = fingerprint_request(&id, &request);
            recorder.record("fingerprint", fingerprint.short());

            match self.coordinator.join_or_register(&fingerprint).await {
                InFlight::Follower(waiter) => {
                    debug!(dependency = %id, "Joining identical in-flight request");
                    metrics::increment_coalesced_requests(&id);
                    recorder.record("coalesced", true);
                    waiter.wait().await
                }
                InFlight::Leader(ticket) => {
                    recorder.record("coalesced", false);
                    let leader = LeaderGuard::new(Arc::clone(&self.coordinator), ticket);
                    let result = self.execute(&id, &provider, &request).await;
                    leader.complete(result.clone()).await;
                    result
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        id: &str,
        provider: &SharedProvider<C::Handle>,
        request: &RequestDescriptor,
    ) -> GatewayResult<ProviderResponse> {
        let started = Instant::now();
        let destination = provider.destination();

        let result = match self.pool.get_client(destination).await {
            Ok(client) => {
                let result = {
                    let provider = provider.as_ref();
                    let handle = client.handle();
                    self.executor
                        .execute_with_retry(id, || provider.execute(request, handle), None, None)
                        .await
                };
                if let Err(e) = self.pool.release_client(client).await {
                    warn!(dependency = %id, destination, error = %e, "Failed to release connection");
                }
                if let Ok(response) = &result {
                    self.pool.record_transfer(destination, response.bytes).await;
                }
                result
            }
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed();
        let error_type = result.as_ref().err().map(GatewayError::error_type);
        self.coordinator
            .record_performance(
                id,
                elapsed.as_secs_f64() * 1_000.0,
                result.is_ok(),
                error_type,
            )
            .await;
        metrics::record_dependency_request(id, elapsed, result.is_ok());
        result
    }

    pub async fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pool: self.pool.stats().await,
            retry: self.executor.stats(),
            circuit_breakers: self.breakers().all_stats().await,
            dependencies: self.coordinator.all_metrics().await,
            in_flight: self.coordinator.in_flight_count(),
        }
    }

    /// Fail pending requests, close every connection and dispose every instance.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.pool.shutdown().await;
        self.registry.clear().await;
    }
}
