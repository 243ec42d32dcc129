//! Per-dependency circuit breakers.
//!
//! Each dependency gets an independent three-state breaker:
//! - Closed: operations run; failures inside the failure window are counted
//! - Open: operations are rejected until the recovery timeout has elapsed
//! - HalfOpen: a random fraction of operations run as probes
//!
//! Breakers are created lazily on first reference and live in a
//! [`CircuitBreakerRegistry`], so no lock is shared between dependencies.
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use scc::HashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::CircuitBreakerConfig,
    error::{GatewayError, GatewayResult},
    metrics,
    utils::{RandomSource, ThreadRandom},
};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub dependency: String,
    pub state: CircuitState,
    /// Failures inside the current failure window
    pub failure_count: usize,
    /// Probe successes since entering HalfOpen
    pub success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejections: u64,
    pub open_count: u64,
    /// Milliseconds until an Open breaker admits a probe
    pub retry_in_ms: u64,
}

/// One dependency's breaker state machine.
///
/// Timestamps are passed in by the caller so that the registry can use a
/// single clock reading per call.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: Arc<CircuitBreakerConfig>,
    state: CircuitState,
    recent_failures: VecDeque<Instant>,
    success_count: u32,
    opened_at: Option<Instant>,
    half_opened_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    rejections: u64,
    open_count: u64,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: Arc<CircuitBreakerConfig>) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            success_count: 0,
            opened_at: None,
            half_opened_at: None,
            total_successes: 0,
            total_failures: 0,
            rejections: 0,
            open_count: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures inside the window ending at `now`
    pub fn failure_count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.recent_failures.len()
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.failure_window();
        while let Some(&oldest) = self.recent_failures.front() {
            if now.duration_since(oldest) >= window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        let from = self.state;
        self.state = to;
        match to {
            CircuitState::Closed => {
                self.recent_failures.clear();
                self.success_count = 0;
                self.opened_at = None;
                self.half_opened_at = None;
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.half_opened_at = None;
                self.success_count = 0;
                self.open_count += 1;
            }
            CircuitState::HalfOpen => {
                self.half_opened_at = Some(now);
                self.success_count = 0;
            }
        }
        metrics::set_circuit_state(&self.dependency, to.gauge_value());
        match to {
            CircuitState::Open => warn!(
                dependency = %self.dependency,
                from = %from,
                open_count = self.open_count,
                "Circuit breaker opened"
            ),
            _ => info!(
                dependency = %self.dependency,
                from = %from,
                to = %to,
                "Circuit breaker state transition"
            ),
        }
    }

    /// Time left before an Open breaker moves to HalfOpen
    pub fn retry_in(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => self
                .config
                .recovery_timeout()
                .saturating_sub(now.duration_since(opened_at)),
            _ => Duration::ZERO,
        }
    }

    /// Whether an operation may run now.
    ///
    /// `roll` is a uniform sample in `[0, 1)` used for half-open probe selection.
    /// The call that finds an Open breaker past its recovery timeout moves it to
    /// HalfOpen and is itself let through as the first probe.
    pub fn can_execute(&mut self, now: Instant, roll: f64) -> bool {
        let allowed = match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.retry_in(now).is_zero() {
                    self.transition(CircuitState::HalfOpen, now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => roll < self.config.half_open_request_percent / 100.0,
        };
        if !allowed {
            self.rejections += 1;
        }
        allowed
    }

    pub fn record_success(&mut self, now: Instant) {
        self.total_successes += 1;
        match self.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                self.success_count += 1;
                debug!(
                    dependency = %self.dependency,
                    success_count = self.success_count,
                    success_threshold = self.config.success_threshold,
                    "Half-open probe succeeded"
                );
                if self.success_count >= self.config.success_threshold {
                    self.transition(CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                debug!(dependency = %self.dependency, "Ignoring success recorded while open");
            }
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.total_failures += 1;
        self.prune(now);
        self.recent_failures.push_back(now);
        match self.state {
            CircuitState::Closed => {
                let failures = self.recent_failures.len();
                debug!(
                    dependency = %self.dependency,
                    failures,
                    failure_threshold = self.config.failure_threshold,
                    "Failure recorded"
                );
                if failures >= self.config.failure_threshold as usize {
                    self.transition(CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    pub fn force_open(&mut self, now: Instant) {
        self.transition(CircuitState::Open, now);
    }

    pub fn force_close(&mut self, now: Instant) {
        self.transition(CircuitState::Closed, now);
    }

    pub fn stats(&mut self, now: Instant) -> CircuitBreakerStats {
        CircuitBreakerStats {
            dependency: self.dependency.clone(),
            state: self.state,
            failure_count: self.failure_count(now),
            success_count: self.success_count,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            rejections: self.rejections,
            open_count: self.open_count,
            retry_in_ms: self.retry_in(now).as_millis() as u64,
        }
    }
}

/// Lazily populated map of breakers keyed by dependency id
pub struct CircuitBreakerRegistry {
    config: Arc<CircuitBreakerConfig>,
    breakers: HashMap<String, CircuitBreaker>,
    random: Arc<dyn RandomSource>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_random(config, Arc::new(ThreadRandom))
    }

    /// Use a specific random source for half-open probe selection
    pub fn with_random(config: CircuitBreakerConfig, random: Arc<dyn RandomSource>) -> Self {
        Self {
            config: Arc::new(config),
            breakers: HashMap::new(),
            random,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    async fn with_breaker<R>(
        &self,
        dependency: &str,
        f: impl FnOnce(&mut CircuitBreaker, Instant) -> R,
    ) -> R {
        let mut entry = self
            .breakers
            .entry_async(dependency.to_string())
            .await
            .or_insert_with(|| CircuitBreaker::new(dependency, Arc::clone(&self.config)));
        f(entry.get_mut(), Instant::now())
    }

    pub async fn can_execute(&self, dependency: &str) -> bool {
        let roll = self.random.next_f64();
        self.with_breaker(dependency, |breaker, now| breaker.can_execute(now, roll))
            .await
    }

    /// Like [`can_execute`](Self::can_execute) but yields the rejection as an error.
    pub async fn check(&self, dependency: &str) -> GatewayResult<()> {
        let roll = self.random.next_f64();
        self.with_breaker(dependency, |breaker, now| {
            if breaker.can_execute(now, roll) {
                Ok(())
            } else {
                Err(GatewayError::CircuitOpen {
                    dependency: dependency.to_string(),
                    retry_in_ms: breaker.retry_in(now).as_millis() as u64,
                })
            }
        })
        .await
    }

    pub async fn record_success(&self, dependency: &str) {
        self.with_breaker(dependency, |breaker, now| breaker.record_success(now))
            .await;
    }

    pub async fn record_failure(&self, dependency: &str) {
        self.with_breaker(dependency, |breaker, now| breaker.record_failure(now))
            .await;
    }

    pub async fn force_open(&self, dependency: &str) {
        self.with_breaker(dependency, |breaker, now| breaker.force_open(now))
            .await;
    }

    pub async fn force_close(&self, dependency: &str) {
        self.with_breaker(dependency, |breaker, now| breaker.force_close(now))
            .await;
    }

    /// Current state; dependencies never referenced are Closed.
    pub async fn state(&self, dependency: &str) -> CircuitState {
        self.breakers
            .read_async(dependency, |_, breaker| breaker.state())
            .await
            .unwrap_or(CircuitState::Closed)
    }

    pub async fn stats(&self, dependency: &str) -> Option<CircuitBreakerStats> {
        let now = Instant::now();
        self.breakers
            .update_async(dependency, |_, breaker| breaker.stats(now))
            .await
    }

    /// Snapshot of every breaker, sorted by dependency id
    pub async fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let now = Instant::now();
        let mut all = Vec::new();
        self.breakers
            .retain_async(|_, breaker| {
                all.push(breaker.stats(now));
                true
            })
            .await;
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }

    /// Drop a dependency's breaker; the next reference starts Closed.
    pub async fn reset(&self, dependency: &str) -> bool {
        let removed = self.breakers.remove_async(dependency).await.is_some();
        if removed {
            metrics::set_circuit_state(dependency, CircuitState::Closed.gauge_value());
            info!(dependency, "Circuit breaker reset");
        }
        removed
    }
}
