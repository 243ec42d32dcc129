//! In-flight request coalescing and per-dependency performance metrics.
//!
//! At most one computation runs per [`RequestFingerprint`]: the first caller
//! becomes the leader and every concurrent duplicate waits on a shared
//! `watch` channel for the leader's terminal outcome. Entries left unresolved
//! past the in-flight TTL are failed with
//! [`GatewayError::DuplicateRequestTimeout`] and treated as absent.
//!
//! Every registration carries a generation number. A leader completing through
//! its [`InFlightTicket`] only resolves the entry it registered, never a newer
//! one that replaced it after expiry.
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use scc::HashMap;
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, interval},
};
use tracing::{Instrument, debug, info, warn};

use super::fingerprint::RequestFingerprint;
use crate::{
    config::CoordinatorConfig,
    error::{GatewayError, GatewayResult},
    tracing_setup,
    utils::SampleWindow,
};

type Outcome<T> = Option<GatewayResult<T>>;

struct InFlightEntry<T> {
    sender: watch::Sender<Outcome<T>>,
    registered_at: Instant,
    generation: u64,
}

impl<T> InFlightEntry<T> {
    fn new(now: Instant, generation: u64) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender,
            registered_at: now,
            generation,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.registered_at) >= ttl
    }

    /// Resolve every waiter with a timeout, returning how many were waiting
    fn expire(self, fingerprint: &RequestFingerprint) -> usize {
        let waiters = self.sender.receiver_count();
        self.sender
            .send_replace(Some(Err(GatewayError::DuplicateRequestTimeout {
                fingerprint: fingerprint.to_string(),
            })));
        waiters
    }
}

/// Handle on another caller's in-flight computation.
pub struct InFlightWaiter<T> {
    fingerprint: RequestFingerprint,
    receiver: watch::Receiver<Outcome<T>>,
}

impl<T: Clone> InFlightWaiter<T> {
    pub fn fingerprint(&self) -> &RequestFingerprint {
        &self.fingerprint
    }

    /// Wait for the leader's terminal outcome.
    pub async fn wait(mut self) -> GatewayResult<T> {
        loop {
            if let Some(outcome) = self.receiver.borrow_and_update().clone() {
                return outcome;
            }
            if self.receiver.changed().await.is_err() {
                // the sender keeps its last value after being dropped
                return self.receiver.borrow().clone().unwrap_or_else(|| {
                    Err(GatewayError::Operation(format!(
                        "in-flight request {} was abandoned",
                        self.fingerprint.short()
                    )))
                });
            }
        }
    }
}

/// Proof of one registration, handed to the leader that must complete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTicket {
    fingerprint: RequestFingerprint,
    generation: u64,
}

impl InFlightTicket {
    pub fn fingerprint(&self) -> &RequestFingerprint {
        &self.fingerprint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of [`RequestCoordinator::join_or_register`]
pub enum InFlight<T> {
    /// The caller registered the entry and must complete it
    Leader(InFlightTicket),
    /// An identical request is already running
    Follower(InFlightWaiter<T>),
}

struct DependencyMetrics {
    /// (duration ms, success)
    samples: SampleWindow<(f64, bool)>,
    error_counts: BTreeMap<String, u64>,
    total_requests: u64,
    first_request_at: DateTime<Utc>,
    last_request_at: DateTime<Utc>,
}

impl DependencyMetrics {
    fn new(history_limit: usize, now: DateTime<Utc>) -> Self {
        Self {
            samples: SampleWindow::new(history_limit),
            error_counts: BTreeMap::new(),
            total_requests: 0,
            first_request_at: now,
            last_request_at: now,
        }
    }

    fn snapshot(&self, dependency: &str) -> DependencyMetricsSnapshot {
        let count = self.samples.len();
        let (total_ms, successes) = self
            .samples
            .iter()
            .fold((0.0, 0usize), |(total, ok), (ms, success)| {
                (total + ms, ok + usize::from(*success))
            });
        DependencyMetricsSnapshot {
            dependency: dependency.to_string(),
            total_requests: self.total_requests,
            sample_count: count,
            average_duration_ms: if count == 0 { 0.0 } else { total_ms / count as f64 },
            success_rate: if count == 0 {
                0.0
            } else {
                successes as f64 / count as f64
            },
            error_counts: self.error_counts.clone(),
            first_request_at: self.first_request_at,
            last_request_at: self.last_request_at,
        }
    }
}

/// Read-only view of one dependency's performance
#[derive(Debug, Clone, Serialize)]
pub struct DependencyMetricsSnapshot {
    pub dependency: String,
    /// Every recorded request, including those evicted from the history
    pub total_requests: u64,
    /// Requests currently kept in the bounded history
    pub sample_count: usize,
    pub average_duration_ms: f64,
    /// Successes over samples in the history, in [0, 1]
    pub success_rate: f64,
    pub error_counts: BTreeMap<String, u64>,
    pub first_request_at: DateTime<Utc>,
    pub last_request_at: DateTime<Utc>,
}

/// Coalesces duplicate in-flight requests and tracks dependency performance.
pub struct RequestCoordinator<T> {
    config: CoordinatorConfig,
    in_flight: HashMap<RequestFingerprint, InFlightEntry<T>>,
    next_generation: AtomicU64,
    metrics: HashMap<String, DependencyMetrics>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::new(),
            next_generation: AtomicU64::new(1),
            metrics: HashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Spawn the periodic expiry sweep. Calling again restarts it.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let task = tokio::spawn(
            Self::sweep_loop(weak, period)
                .instrument(tracing_setup::configure_component_tracing("request_coordinator")),
        );
        if let Some(previous) = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task)
        {
            previous.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(task) = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    async fn sweep_loop(coordinator: Weak<Self>, period: Duration) {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            coordinator.sweep_expired().await;
        }
    }

    /// Join a live in-flight computation for `fingerprint`, if any.
    ///
    /// An expired entry is failed, removed and reported as absent.
    pub async fn check_duplicate_request(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Option<InFlightWaiter<T>> {
        let now = Instant::now();
        let ttl = self.config.in_flight_ttl();
        let entry = self.in_flight.get_async(fingerprint).await?;
        if entry.get().is_expired(now, ttl) {
            let (key, expired) = entry.remove_entry();
            let waiters = expired.expire(&key);
            warn!(
                fingerprint = %key.short(),
                waiters,
                "In-flight request expired before completion"
            );
            return None;
        }
        Some(InFlightWaiter {
            fingerprint: fingerprint.clone(),
            receiver: entry.get().sender.subscribe(),
        })
    }

    /// Register a pending placeholder for `fingerprint`.
    ///
    /// Returns `false` if a live entry already exists; it is never replaced.
    pub async fn register_in_flight_request(&self, fingerprint: &RequestFingerprint) -> bool {
        matches!(self.join_or_register(fingerprint).await, InFlight::Leader(_))
    }

    /// Check for a live duplicate and register a placeholder in one step.
    pub async fn join_or_register(&self, fingerprint: &RequestFingerprint) -> InFlight<T> {
        let now = Instant::now();
        let ttl = self.config.in_flight_ttl();
        let ticket = InFlightTicket {
            fingerprint: fingerprint.clone(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        match self.in_flight.entry_async(fingerprint.clone()).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now, ttl) {
                    return InFlight::Follower(InFlightWaiter {
                        fingerprint: fingerprint.clone(),
                        receiver: occupied.get().sender.subscribe(),
                    });
                }
                let expired = std::mem::replace(
                    occupied.get_mut(),
                    InFlightEntry::new(now, ticket.generation),
                );
                let waiters = expired.expire(fingerprint);
                warn!(
                    fingerprint = %fingerprint.short(),
                    waiters,
                    generation = ticket.generation,
                    "Replaced expired in-flight request"
                );
                InFlight::Leader(ticket)
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(InFlightEntry::new(now, ticket.generation));
                debug!(
                    fingerprint = %fingerprint.short(),
                    generation = ticket.generation,
                    "Registered in-flight request"
                );
                InFlight::Leader(ticket)
            }
        }
    }

    /// Resolve every waiter with `result` and remove the entry.
    ///
    /// Returns the number of waiters released; zero if nothing was registered.
    pub async fn complete_in_flight_request(
        &self,
        fingerprint: &RequestFingerprint,
        result: GatewayResult<T>,
    ) -> usize {
        match self.in_flight.remove_async(fingerprint).await {
            Some((_, entry)) => Self::resolve(fingerprint, entry, result),
            None => {
                debug!(
                    fingerprint = %fingerprint.short(),
                    "No in-flight entry to complete"
                );
                0
            }
        }
    }

    /// Complete the registration `ticket` was issued for.
    ///
    /// Does nothing when that entry already expired and was replaced, so a
    /// late leader can never resolve another leader's waiters.
    pub async fn complete_registration(
        &self,
        ticket: &InFlightTicket,
        result: GatewayResult<T>,
    ) -> usize {
        let fingerprint = &ticket.fingerprint;
        let Some(entry) = self.in_flight.get_async(fingerprint).await else {
            debug!(
                fingerprint = %fingerprint.short(),
                generation = ticket.generation,
                "No in-flight entry to complete"
            );
            return 0;
        };
        if entry.get().generation != ticket.generation {
            debug!(
                fingerprint = %fingerprint.short(),
                generation = ticket.generation,
                current = entry.get().generation,
                "In-flight entry belongs to a newer registration"
            );
            return 0;
        }
        let (_, entry) = entry.remove_entry();
        Self::resolve(fingerprint, entry, result)
    }

    fn resolve(
        fingerprint: &RequestFingerprint,
        entry: InFlightEntry<T>,
        result: GatewayResult<T>,
    ) -> usize {
        let waiters = entry.sender.receiver_count();
        entry.sender.send_replace(Some(result));
        debug!(
            fingerprint = %fingerprint.short(),
            waiters,
            "Completed in-flight request"
        );
        waiters
    }

    /// Fail and purge every entry older than the in-flight TTL.
    ///
    /// Returns the number of entries purged.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.in_flight_ttl();
        let mut expired = Vec::new();
        self.in_flight
            .retain_async(|fingerprint, entry| {
                if entry.is_expired(now, ttl) {
                    let (sender, _) = watch::channel(None);
                    let stale = std::mem::replace(&mut entry.sender, sender);
                    expired.push((fingerprint.clone(), stale));
                    false
                } else {
                    true
                }
            })
            .await;

        let purged = expired.len();
        for (fingerprint, sender) in expired {
            sender.send_replace(Some(Err(GatewayError::DuplicateRequestTimeout {
                fingerprint: fingerprint.to_string(),
            })));
        }
        if purged > 0 {
            info!(purged, "Purged expired in-flight requests");
        }
        purged
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Append one request outcome to the dependency's bounded history.
    pub async fn record_performance(
        &self,
        dependency: &str,
        duration_ms: f64,
        success: bool,
        error_type: Option<&str>,
    ) {
        let now = Utc::now();
        let limit = self.config.metrics_history_limit;
        let mut entry = self
            .metrics
            .entry_async(dependency.to_string())
            .await
            .or_insert_with(|| DependencyMetrics::new(limit, now));
        let metrics = entry.get_mut();
        metrics.samples.push((duration_ms.max(0.0), success));
        metrics.total_requests += 1;
        metrics.last_request_at = now;
        if !success {
            *metrics
                .error_counts
                .entry(error_type.unwrap_or("unknown").to_string())
                .or_insert(0) += 1;
        }
    }

    pub async fn dependency_metrics(&self, dependency: &str) -> Option<DependencyMetricsSnapshot> {
        self.metrics
            .read_async(dependency, |key, metrics| metrics.snapshot(key))
            .await
    }

    /// Snapshots for every dependency, sorted by id
    pub async fn all_metrics(&self) -> Vec<DependencyMetricsSnapshot> {
        let mut all = Vec::new();
        self.metrics
            .retain_async(|key, metrics| {
                all.push(metrics.snapshot(key));
                true
            })
            .await;
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }

    pub async fn reset_metrics(&self) {
        self.metrics.retain_async(|_, _| false).await;
    }

    /// Stop the sweep and fail everything still in flight.
    pub async fn shutdown(&self) {
        self.stop_sweeper();
        let mut pending = Vec::new();
        self.in_flight
            .retain_async(|fingerprint, entry| {
                let (sender, _) = watch::channel(None);
                pending.push((fingerprint.clone(), std::mem::replace(&mut entry.sender, sender)));
                false
            })
            .await;
        for (fingerprint, sender) in pending {
            sender.send_replace(Some(Err(GatewayError::DuplicateRequestTimeout {
                fingerprint: fingerprint.to_string(),
            })));
        }
    }
}

impl<T> Drop for RequestCoordinator<T> {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(task) = sweeper.take() {
                task.abort();
            }
        }
    }
}
