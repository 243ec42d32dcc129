//! Per-destination connection pooling.
//!
//! The pool keeps, for every destination, a queue of idle connection handles
//! and the set of handles currently checked out. Two limits apply to pooled
//! handles: a per-destination cap and a global cap across destinations. When
//! either is reached the pool does not wait: it hands out a temporary,
//! unpooled overflow handle that is closed on release.
//!
//! Handles are recycled on release while younger than the keep-alive limit and
//! closed by a periodic sweep once idle for longer than the max-idle threshold.
//! A client dropped without being released (its task was cancelled, say) is
//! reclaimed by the next acquisition for that destination or by the sweep.
use std::{
    collections::{HashMap as StdHashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use scc::HashMap;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{Instant, interval, timeout},
};
use tracing::{Instrument, debug, info, warn};

use crate::{
    config::PoolConfig,
    error::{GatewayError, GatewayResult},
    metrics,
    ports::Connector,
    tracing_setup,
    utils::SampleWindow,
};

/// Request-duration samples kept per destination
const DURATION_SAMPLE_LIMIT: usize = 1_000;

/// A connection handle checked out of the pool.
///
/// Hand it back with [`ConnectionPool::release_client`]. Dropping it instead
/// leaves the connection checked out until the pool notices the handle is no
/// longer shared and takes it back.
#[derive(Debug)]
pub struct PooledClient<H> {
    id: u64,
    destination: String,
    handle: Arc<H>,
    pooled: bool,
    usage_count: u64,
    acquired_at: Instant,
}

impl<H> PooledClient<H> {
    /// The underlying connection handle
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// False for overflow handles created past a limit
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// How many times the underlying connection has been handed out
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }
}

/// Pool-side record of a connection.
struct PooledConnection<H> {
    id: u64,
    handle: Arc<H>,
    created_at: Instant,
    last_used: Instant,
    usage_count: u64,
    in_use: bool,
}

impl<H> PooledConnection<H> {
    fn new(id: u64, handle: Arc<H>, now: Instant) -> Self {
        Self {
            id,
            handle,
            created_at: now,
            last_used: now,
            usage_count: 1,
            in_use: true,
        }
    }

    fn is_reusable(&self, now: Instant, config: &PoolConfig) -> bool {
        now.duration_since(self.created_at) < config.keep_alive()
            && now.duration_since(self.last_used) < config.max_idle()
    }

    fn check_out(&mut self, now: Instant) {
        self.usage_count += 1;
        self.last_used = now;
        self.in_use = true;
    }

    fn check_in(&mut self, now: Instant) {
        self.last_used = now;
        self.in_use = false;
    }

    fn client(&self, destination: &str, now: Instant) -> PooledClient<H> {
        PooledClient {
            id: self.id,
            destination: destination.to_string(),
            handle: Arc::clone(&self.handle),
            pooled: true,
            usage_count: self.usage_count,
            acquired_at: now,
        }
    }
}

/// Connections and counters for one destination.
struct DestinationPool<H> {
    available: VecDeque<PooledConnection<H>>,
    active: StdHashMap<u64, PooledConnection<H>>,
    /// Slots reserved for connections still being established
    pending: usize,
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    overflow_created: u64,
    bytes_transferred: u64,
    durations_ms: SampleWindow<f64>,
}

impl<H> DestinationPool<H> {
    fn new() -> Self {
        Self {
            available: VecDeque::new(),
            active: StdHashMap::new(),
            pending: 0,
            total_requests: 0,
            cache_hits: 0,
            cache_misses: 0,
            overflow_created: 0,
            bytes_transferred: 0,
            durations_ms: SampleWindow::new(DURATION_SAMPLE_LIMIT),
        }
    }

    fn tracked(&self) -> usize {
        self.available.len() + self.active.len() + self.pending
    }

    /// Move checked-out connections whose client was dropped back to the idle
    /// queue. Only the pool's record holds the handle once the client is gone.
    fn reclaim_dropped(&mut self, destination: &str, now: Instant) -> usize {
        let dropped: Vec<u64> = self
            .active
            .iter()
            .filter(|(_, conn)| Arc::strong_count(&conn.handle) == 1)
            .map(|(id, _)| *id)
            .collect();
        for id in &dropped {
            if let Some(mut conn) = self.active.remove(id) {
                warn!(
                    destination,
                    connection_id = *id,
                    "Reclaiming connection dropped without release"
                );
                conn.check_in(now);
                self.available.push_back(conn);
            }
        }
        dropped.len()
    }

    fn stats(&self, destination: &str) -> DestinationStats {
        let lookups = self.cache_hits + self.cache_misses;
        DestinationStats {
            destination: destination.to_string(),
            active: self.active.len(),
            idle: self.available.len(),
            pending: self.pending,
            total_requests: self.total_requests,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.cache_hits as f64 / lookups as f64
            },
            overflow_created: self.overflow_created,
            bytes_transferred: self.bytes_transferred,
            average_duration_ms: self.durations_ms.mean(),
            duration_samples: self.durations_ms.len(),
        }
    }
}

/// Statistics for one destination
#[derive(Debug, Clone, Serialize)]
pub struct DestinationStats {
    pub destination: String,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub overflow_created: u64,
    pub bytes_transferred: u64,
    pub average_duration_ms: f64,
    pub duration_samples: usize,
}

impl DestinationStats {
    /// Pooled connections tracked for the destination (idle + active)
    pub fn tracked(&self) -> usize {
        self.active + self.idle
    }
}

/// Pool-wide statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Per-destination stats, sorted by destination
    pub destinations: Vec<DestinationStats>,
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub overflow_created: u64,
    pub max_total_connections: usize,
    /// Tracked connections over the global cap
    pub utilization: f64,
}

impl PoolStats {
    pub fn destination(&self, destination: &str) -> Option<&DestinationStats> {
        self.destinations
            .iter()
            .find(|stats| stats.destination == destination)
    }
}

/// Outcome of the locked phase of `get_client`
enum Acquisition<H> {
    Reused(PooledClient<H>),
    Create,
    Overflow,
}

/// Connection pool manager for all destinations
pub struct ConnectionPool<C: Connector> {
    connector: Arc<C>,
    config: RwLock<Option<Arc<PoolConfig>>>,
    destinations: HashMap<String, DestinationPool<C::Handle>>,
    /// Pooled connections across destinations, including pending reservations
    total_connections: AtomicUsize,
    overflow_created: AtomicU64,
    next_id: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an uninitialized pool; call [`initialize`](Self::initialize) before use.
    pub fn new(connector: Arc<C>) -> Self {
        Self {
            connector,
            config: RwLock::new(None),
            destinations: HashMap::new(),
            total_connections: AtomicUsize::new(0),
            overflow_created: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            sweeper: Mutex::new(None),
        }
    }

    /// Install the configuration and start the idle sweep.
    ///
    /// Returns `false` (and changes nothing) if the pool is already initialized.
    pub fn initialize(self: &Arc<Self>, config: PoolConfig) -> bool {
        let sweep_interval = config.sweep_interval();
        {
            let mut current = self
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_some() {
                debug!("Connection pool already initialized");
                return false;
            }
            info!(
                max_per_destination = config.max_connections_per_destination,
                max_total = config.max_total_connections,
                keep_alive_ms = config.keep_alive_ms,
                max_idle_ms = config.max_idle_ms,
                "Initializing connection pool"
            );
            *current = Some(Arc::new(config));
        }

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(
            Self::sweep_loop(weak, sweep_interval)
                .instrument(tracing_setup::configure_component_tracing("connection_pool")),
        );
        if let Some(previous) = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task)
        {
            previous.abort();
        }
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.current_config().is_ok()
    }

    fn current_config(&self) -> GatewayResult<Arc<PoolConfig>> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| {
                GatewayError::Usage("connection pool used before initialize()".to_string())
            })
    }

    async fn sweep_loop(pool: Weak<Self>, period: std::time::Duration) {
        let mut ticker = interval(period);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            let closed = pool.sweep_idle().await;
            if closed > 0 {
                debug!(closed, "Idle sweep closed connections");
            }
        }
    }

    /// Reserve one slot of the global cap, failing if it is exhausted
    fn try_reserve_global(&self, max_total: usize) -> bool {
        self.total_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max_total).then_some(current + 1)
            })
            .is_ok()
    }

    fn release_global(&self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self
            .total_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
        metrics::set_pool_connections(self.total_connections.load(Ordering::Acquire));
    }

    async fn close_all(&self, destination: &str, handles: Vec<Arc<C::Handle>>) {
        for handle in handles {
            self.connector.close(destination, handle).await;
        }
    }

    async fn open(&self, destination: &str, config: &PoolConfig) -> GatewayResult<C::Handle> {
        match timeout(
            config.connect_timeout(),
            self.connector.connect(destination, config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "connecting to {destination} took longer than {}ms",
                config.connect_timeout_ms
            ))),
        }
    }

    /// Check out a connection handle for `destination`.
    ///
    /// Reuses an idle handle when one is still fresh, otherwise opens a new pooled
    /// handle if both limits allow, otherwise opens an unpooled overflow handle.
    pub async fn get_client(&self, destination: &str) -> GatewayResult<PooledClient<C::Handle>> {
        let config = self.current_config()?;
        let now = Instant::now();
        let mut stale = Vec::new();

        let acquisition = {
            let mut entry = self
                .destinations
                .entry_async(destination.to_string())
                .await
                .or_insert_with(DestinationPool::new);
            let pool = entry.get_mut();
            pool.total_requests += 1;
            pool.reclaim_dropped(destination, now);

            let mut reused = None;
            while let Some(mut conn) = pool.available.pop_back() {
                if conn.is_reusable(now, &config) {
                    conn.check_out(now);
                    reused = Some(conn.client(destination, now));
                    pool.active.insert(conn.id, conn);
                    break;
                }
                stale.push(conn.handle);
            }

            match reused {
                Some(client) => {
                    pool.cache_hits += 1;
                    Acquisition::Reused(client)
                }
                None => {
                    pool.cache_misses += 1;
                    if pool.tracked() < config.max_connections_per_destination
                        && self.try_reserve_global(config.max_total_connections)
                    {
                        pool.pending += 1;
                        Acquisition::Create
                    } else {
                        pool.overflow_created += 1;
                        Acquisition::Overflow
                    }
                }
            }
        };

        if !stale.is_empty() {
            debug!(
                destination,
                discarded = stale.len(),
                "Discarding stale idle connections"
            );
            self.release_global(stale.len());
            self.close_all(destination, stale).await;
        }

        match acquisition {
            Acquisition::Reused(client) => {
                debug!(
                    destination,
                    connection_id = client.id,
                    usage_count = client.usage_count,
                    "Reusing pooled connection"
                );
                metrics::increment_connections_reused(destination);
                Ok(client)
            }
            Acquisition::Create => self.create_pooled(destination, &config).await,
            Acquisition::Overflow => {
                self.overflow_created.fetch_add(1, Ordering::Relaxed);
                metrics::increment_overflow_connections(destination);
                warn!(
                    destination,
                    max_per_destination = config.max_connections_per_destination,
                    max_total = config.max_total_connections,
                    "Connection limit reached, creating unpooled overflow connection"
                );
                let handle = self.open(destination, &config).await?;
                Ok(PooledClient {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    destination: destination.to_string(),
                    handle: Arc::new(handle),
                    pooled: false,
                    usage_count: 1,
                    acquired_at: Instant::now(),
                })
            }
        }
    }

    async fn create_pooled(
        &self,
        destination: &str,
        config: &PoolConfig,
    ) -> GatewayResult<PooledClient<C::Handle>> {
        let opened = self.open(destination, config).await;
        let now = Instant::now();
        let still_initialized = self.is_initialized();

        let client = {
            let mut entry = self
                .destinations
                .entry_async(destination.to_string())
                .await
                .or_insert_with(DestinationPool::new);
            let pool = entry.get_mut();
            pool.pending = pool.pending.saturating_sub(1);

            match opened {
                Ok(handle) if still_initialized => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = PooledConnection::new(id, Arc::new(handle), now);
                    let client = conn.client(destination, now);
                    pool.active.insert(id, conn);
                    Ok(client)
                }
                Ok(handle) => Err(Some(Arc::new(handle))),
                Err(e) => {
                    warn!(destination, error = %e, "Failed to open pooled connection");
                    self.release_global(1);
                    return Err(e);
                }
            }
        };

        match client {
            Ok(client) => {
                metrics::increment_connections_created(destination);
                metrics::set_pool_connections(self.total_connections.load(Ordering::Acquire));
                info!(
                    destination,
                    connection_id = client.id,
                    total_connections = self.total_connections.load(Ordering::Acquire),
                    "Created pooled connection"
                );
                Ok(client)
            }
            Err(handle) => {
                // shut down while connecting
                self.release_global(1);
                if let Some(handle) = handle {
                    self.connector.close(destination, handle).await;
                }
                Err(GatewayError::Usage(
                    "connection pool was shut down while connecting".to_string(),
                ))
            }
        }
    }

    /// Return a checked-out handle to the pool.
    ///
    /// Overflow handles are closed. Pooled handles are requeued while younger
    /// than the keep-alive limit and closed otherwise. Releasing a pooled handle
    /// the pool no longer tracks is a usage error.
    pub async fn release_client(&self, client: PooledClient<C::Handle>) -> GatewayResult<()> {
        let PooledClient {
            id,
            destination,
            handle,
            pooled,
            acquired_at,
            ..
        } = client;

        if !pooled {
            debug!(destination = %destination, "Closing overflow connection");
            self.connector.close(&destination, handle).await;
            return Ok(());
        }
        // held until the record leaves `active` so it is never taken for dropped
        let _handle = handle;

        let keep_alive = match self.current_config() {
            Ok(config) => config.keep_alive(),
            Err(_) => {
                return Err(GatewayError::Usage(format!(
                    "connection {id} for {destination} released after pool shutdown"
                )));
            }
        };

        let now = Instant::now();
        let discarded = match self.destinations.get_async(&destination).await {
            Some(mut entry) => {
                let pool = entry.get_mut();
                let Some(mut conn) = pool.active.remove(&id) else {
                    return Err(GatewayError::Usage(format!(
                        "connection {id} is not checked out from {destination}"
                    )));
                };
                pool.durations_ms
                    .push(now.duration_since(acquired_at).as_secs_f64() * 1_000.0);

                if now.duration_since(conn.created_at) < keep_alive {
                    conn.check_in(now);
                    pool.available.push_back(conn);
                    None
                } else {
                    Some(conn.handle)
                }
            }
            None => {
                return Err(GatewayError::Usage(format!(
                    "no pool is tracking destination {destination}"
                )));
            }
        };

        if let Some(handle) = discarded {
            debug!(
                destination = %destination,
                connection_id = id,
                "Connection exceeded keep-alive, closing"
            );
            self.release_global(1);
            self.connector.close(&destination, handle).await;
        }
        Ok(())
    }

    /// Add to the bytes-transferred counter of a destination.
    pub async fn record_transfer(&self, destination: &str, bytes: u64) {
        let _ = self
            .destinations
            .update_async(destination, |_, pool| {
                pool.bytes_transferred += bytes;
            })
            .await;
    }

    /// Close idle connections past the max-idle threshold or keep-alive age.
    ///
    /// Returns the number of connections closed.
    pub async fn sweep_idle(&self) -> usize {
        let Ok(config) = self.current_config() else {
            return 0;
        };
        let now = Instant::now();
        let mut expired: Vec<(String, Arc<C::Handle>)> = Vec::new();

        self.destinations
            .retain_async(|destination, pool| {
                pool.reclaim_dropped(destination, now);
                let before = pool.available.len();
                let mut kept = VecDeque::with_capacity(before);
                for conn in pool.available.drain(..) {
                    if conn.is_reusable(now, &config) {
                        kept.push_back(conn);
                    } else {
                        expired.push((destination.clone(), conn.handle));
                    }
                }
                pool.available = kept;
                true
            })
            .await;

        let closed = expired.len();
        if closed > 0 {
            self.release_global(closed);
            for (destination, handle) in expired {
                self.connector.close(&destination, handle).await;
            }
            info!(closed, "Closed idle connections");
        }
        closed
    }

    /// Close every connection, stop the sweep and forget all state.
    ///
    /// The pool must be initialized again before further use.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        self.config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let mut handles: Vec<(String, Arc<C::Handle>)> = Vec::new();
        self.destinations
            .retain_async(|destination, pool| {
                handles.extend(
                    pool.available
                        .drain(..)
                        .map(|conn| (destination.clone(), conn.handle)),
                );
                handles.extend(
                    pool.active
                        .drain()
                        .map(|(_, conn)| (destination.clone(), conn.handle)),
                );
                false
            })
            .await;

        self.total_connections.store(0, Ordering::Release);
        metrics::set_pool_connections(0);

        let closed = handles.len();
        for (destination, handle) in handles {
            self.connector.close(&destination, handle).await;
        }
        info!(closed, "Connection pool shut down");
    }

    /// Snapshot utilization and per-destination counters.
    pub async fn stats(&self) -> PoolStats {
        let max_total = self
            .current_config()
            .map(|config| config.max_total_connections)
            .unwrap_or(0);

        let mut destinations = Vec::new();
        self.destinations
            .retain_async(|destination, pool| {
                destinations.push(pool.stats(destination));
                true
            })
            .await;
        destinations.sort_by(|a, b| a.destination.cmp(&b.destination));

        let active_connections = destinations.iter().map(|d| d.active).sum();
        let idle_connections = destinations.iter().map(|d| d.idle).sum();
        let total_connections = self.total_connections.load(Ordering::Acquire);

        PoolStats {
            destinations,
            total_connections,
            active_connections,
            idle_connections,
            overflow_created: self.overflow_created.load(Ordering::Relaxed),
            max_total_connections: max_total,
            utilization: if max_total == 0 {
                0.0
            } else {
                total_connections as f64 / max_total as f64
            },
        }
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(task) = sweeper.take() {
                task.abort();
            }
        }
    }
}
