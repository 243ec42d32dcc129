//! Bounded retries with exponential backoff and jitter, gated by the
//! dependency's circuit breaker.
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use scc::HashMap;
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreakerRegistry;
use crate::{
    config::RetryConfig,
    error::{GatewayError, GatewayResult},
    metrics,
    utils::{RandomSource, ThreadRandom},
};

/// Information handed to the retry observer before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based index of the attempt about to run
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay that will elapse before the attempt, jitter included
    pub delay: Duration,
    /// Time spent since the first attempt started
    pub elapsed: Duration,
    pub previous_error: Option<GatewayError>,
    pub is_final_attempt: bool,
}

/// Observer invoked before each retry delay
pub type RetryObserver<'a> = &'a (dyn Fn(&RetryAttempt) + Send + Sync);

/// Retry counters, global or per dependency
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub total_operations: u64,
    pub first_attempt_successes: u64,
    /// Successes that needed at least one retry
    pub eventual_successes: u64,
    pub failures: u64,
    pub retry_attempts: u64,
    pub circuit_rejections: u64,
}

#[derive(Default)]
struct RetryCounters {
    total_operations: AtomicU64,
    first_attempt_successes: AtomicU64,
    eventual_successes: AtomicU64,
    failures: AtomicU64,
    retry_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
}

impl RetryCounters {
    fn snapshot(&self) -> RetryStats {
        RetryStats {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            first_attempt_successes: self.first_attempt_successes.load(Ordering::Relaxed),
            eventual_successes: self.eventual_successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Terminal outcome of one `execute_with_retry` call, for the counters
#[derive(Clone, Copy)]
enum Outcome {
    Rejected,
    Succeeded { retries: u32 },
    Failed { retries: u32 },
}

/// Backoff delay before `attempt` (2-based), without jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt < 2 {
        return Duration::ZERO;
    }
    let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
    let millis = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = millis.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped.round() as u64)
}

/// Spread `delay` by up to `delay * factor` in either direction, floored at zero.
///
/// `roll` is a uniform sample in `[0, 1)`.
pub fn apply_jitter(delay: Duration, factor: f64, roll: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let base = delay.as_secs_f64();
    let jitter = base * factor;
    let offset = (roll * 2.0 - 1.0) * jitter;
    Duration::from_secs_f64((base + offset).max(0.0))
}

/// Wraps dependency operations with retries and breaker bookkeeping.
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    default_config: RetryConfig,
    random: Arc<dyn RandomSource>,
    global: RetryCounters,
    per_dependency: HashMap<String, RetryStats>,
}

impl RetryExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, default_config: RetryConfig) -> Self {
        Self::with_random(breakers, default_config, Arc::new(ThreadRandom))
    }

    /// Use a specific random source for jitter
    pub fn with_random(
        breakers: Arc<CircuitBreakerRegistry>,
        default_config: RetryConfig,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            breakers,
            default_config,
            random,
            global: RetryCounters::default(),
            per_dependency: HashMap::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn default_config(&self) -> &RetryConfig {
        &self.default_config
    }

    /// Run `operation` for `dependency`, retrying transient failures.
    ///
    /// The breaker is consulted once before the first attempt; a rejection fails
    /// immediately with [`GatewayError::CircuitOpen`] and is not recorded as a
    /// breaker failure. Non-retryable errors and exhausted attempts record one
    /// breaker failure and return the last error unchanged.
    ///
    /// # Arguments
    /// * `dependency` - Dependency id whose breaker and counters are used
    /// * `operation` - Produces one attempt per call
    /// * `config` - Retry policy; the executor's default when `None`
    /// * `on_retry` - Called before each backoff delay
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        dependency: &str,
        mut operation: F,
        config: Option<&RetryConfig>,
        on_retry: Option<RetryObserver<'_>>,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let config = config.unwrap_or(&self.default_config);

        if let Err(rejection) = self.breakers.check(dependency).await {
            debug!(dependency, "Operation rejected by open circuit breaker");
            metrics::increment_circuit_rejections(dependency);
            self.record_outcome(dependency, Outcome::Rejected).await;
            return Err(rejection);
        }

        let max_attempts = config.max_attempts.max(1);
        let started = Instant::now();
        let mut previous_error: Option<GatewayError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = apply_jitter(
                    backoff_delay(config, attempt),
                    config.jitter_factor,
                    self.random.next_f64(),
                );
                let info = RetryAttempt {
                    attempt,
                    max_attempts,
                    delay,
                    elapsed: started.elapsed(),
                    previous_error: previous_error.clone(),
                    is_final_attempt: attempt == max_attempts,
                };
                debug!(
                    dependency,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying operation"
                );
                if let Some(observer) = on_retry {
                    observer(&info);
                }
                metrics::increment_retry_attempts(dependency);
                sleep(delay).await;
            }

            match operation().await {
                Ok(value) => {
                    self.breakers.record_success(dependency).await;
                    self.record_outcome(
                        dependency,
                        Outcome::Succeeded {
                            retries: attempt - 1,
                        },
                    )
                    .await;
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = config.is_retryable(&e);
                    if !retryable || attempt == max_attempts {
                        warn!(
                            dependency,
                            attempt,
                            max_attempts,
                            retryable,
                            error = %e,
                            "Operation failed"
                        );
                        self.breakers.record_failure(dependency).await;
                        self.record_outcome(
                            dependency,
                            Outcome::Failed {
                                retries: attempt - 1,
                            },
                        )
                        .await;
                        return Err(e);
                    }
                    debug!(dependency, attempt, error = %e, "Attempt failed with retryable error");
                    previous_error = Some(e);
                }
            }
        }

        // max_attempts >= 1, so the loop always returns
        Err(previous_error.unwrap_or_else(|| {
            GatewayError::Usage(format!("no attempt was made for {dependency}"))
        }))
    }

    async fn record_outcome(&self, dependency: &str, outcome: Outcome) {
        let apply = |stats: &mut RetryStats| {
            stats.total_operations += 1;
            match outcome {
                Outcome::Rejected => stats.circuit_rejections += 1,
                Outcome::Succeeded { retries } => {
                    stats.retry_attempts += u64::from(retries);
                    if retries == 0 {
                        stats.first_attempt_successes += 1;
                    } else {
                        stats.eventual_successes += 1;
                    }
                }
                Outcome::Failed { retries } => {
                    stats.retry_attempts += u64::from(retries);
                    stats.failures += 1;
                }
            }
        };

        self.global.total_operations.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Rejected => {
                self.global.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Succeeded { retries } => {
                self.global
                    .retry_attempts
                    .fetch_add(u64::from(retries), Ordering::Relaxed);
                if retries == 0 {
                    self.global
                        .first_attempt_successes
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    self.global.eventual_successes.fetch_add(1, Ordering::Relaxed);
                }
            }
            Outcome::Failed { retries } => {
                self.global
                    .retry_attempts
                    .fetch_add(u64::from(retries), Ordering::Relaxed);
                self.global.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut entry = self
            .per_dependency
            .entry_async(dependency.to_string())
            .await
            .or_default();
        apply(entry.get_mut());
    }

    /// Counters across all dependencies
    pub fn stats(&self) -> RetryStats {
        self.global.snapshot()
    }

    pub async fn dependency_stats(&self, dependency: &str) -> Option<RetryStats> {
        self.per_dependency
            .read_async(dependency, |_, stats| stats.clone())
            .await
    }

    pub async fn reset_stats(&self) {
        self.per_dependency.retain_async(|_, _| false).await;
        for counter in [
            &self.global.total_operations,
            &self.global.first_attempt_successes,
            &self.global.eventual_successes,
            &self.global.failures,
            &self.global.retry_attempts,
            &self.global.circuit_rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::AtomicU32};

    use super::*;
    use crate::{
        config::CircuitBreakerConfig,
        core::circuit_breaker::CircuitState,
        utils::FixedRandom,
    };

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        }
    }

    fn executor(failure_threshold: u32) -> RetryExecutor {
        let breakers = Arc::new(CircuitBreakerRegistry::with_random(
            CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            },
            Arc::new(FixedRandom(0.0)),
        ));
        RetryExecutor::with_random(breakers, retry_config(), Arc::new(FixedRandom(0.5)))
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let config = retry_config();
        assert_eq!(backoff_delay(&config, 1), Duration::ZERO);
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 6), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&config, 40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(1_000);
        let low = apply_jitter(delay, 0.1, 0.0);
        let high = apply_jitter(delay, 0.1, 0.999_999);
        let mid = apply_jitter(delay, 0.1, 0.5);
        assert!((low.as_secs_f64() - 0.9).abs() < 1e-9);
        assert!(high <= Duration::from_millis(1_100));
        assert!(high > Duration::from_millis(1_099));
        assert!((mid.as_secs_f64() - 1.0).abs() < 1e-9);
        assert_eq!(apply_jitter(delay, 0.0, 0.0), delay);
        // never negative
        assert_eq!(apply_jitter(delay, 1.5, 0.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let executor = executor(5);
        let calls = AtomicU32::new(0);
        let observed = Mutex::new(Vec::new());
        let observer = |attempt: &RetryAttempt| {
            observed
                .lock()
                .unwrap()
                .push((attempt.attempt, attempt.delay, attempt.is_final_attempt));
        };

        let result = executor
            .execute_with_retry(
                "dep",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(GatewayError::Network("reset".into()))
                        } else {
                            Ok("done")
                        }
                    }
                },
                None,
                Some(&observer),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *observed.lock().unwrap(),
            vec![
                (2, Duration::from_millis(100), false),
                (3, Duration::from_millis(200), true),
            ]
        );

        let stats = executor.stats();
        assert_eq!(stats.eventual_successes, 1);
        assert_eq!(stats.first_attempt_successes, 0);
        assert_eq!(stats.retry_attempts, 2);
        assert_eq!(executor.dependency_stats("dep").await.unwrap(), stats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_actually_sleeps() {
        let executor = executor(5);
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: GatewayResult<()> = executor
            .execute_with_retry(
                "dep",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(GatewayError::Timeout("slow".into())) }
                },
                None,
                None,
            )
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(executor.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let executor = executor(5);
        let calls = AtomicU32::new(0);

        let result: GatewayResult<()> = executor
            .execute_with_retry(
                "dep",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(GatewayError::Status {
                            status: 400,
                            message: "bad request".into(),
                        })
                    }
                },
                None,
                None,
            )
            .await;

        assert!(matches!(result, Err(GatewayError::Status { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failures = executor
            .breakers()
            .stats("dep")
            .await
            .unwrap()
            .failure_count;
        assert_eq!(failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_status_codes_are_retried() {
        let executor = executor(5);
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            retryable_status_codes: vec![409],
            ..retry_config()
        };

        let result = executor
            .execute_with_retry(
                "dep",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(GatewayError::Status {
                                status: 409,
                                message: "conflict".into(),
                            })
                        } else {
                            Ok(n)
                        }
                    }
                },
                Some(&config),
                None,
            )
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_attempt() {
        let executor = executor(2);
        for _ in 0..2 {
            let _: GatewayResult<()> = executor
                .execute_with_retry(
                    "dep",
                    || async { Err(GatewayError::Operation("boom".into())) },
                    None,
                    None,
                )
                .await;
        }
        assert_eq!(
            executor.breakers().state("dep").await,
            CircuitState::Open
        );

        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = executor
            .execute_with_retry(
                "dep",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                None,
                None,
            )
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = executor.dependency_stats("dep").await.unwrap();
        assert_eq!(stats.circuit_rejections, 1);
        assert_eq!(stats.failures, 2);
        let breaker = executor.breakers().stats("dep").await.unwrap();
        assert_eq!(breaker.total_failures, 2);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let executor = executor(5);
        let _ = executor
            .execute_with_retry("dep", || async { Ok(()) }, None, None)
            .await;
        assert_eq!(executor.stats().first_attempt_successes, 1);

        executor.reset_stats().await;
        assert_eq!(executor.stats(), RetryStats::default());
        assert!(executor.dependency_stats("dep").await.is_none());
    }
}
