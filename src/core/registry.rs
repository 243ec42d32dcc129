//! Dependency registry: factories, cached instances and routing.
//!
//! Registrations bind a normalized (lowercased) dependency id to a
//! [`ProviderFactory`] and optional static model prefixes. Live instances are
//! cached separately, keyed by id only, together with a health flag.
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::join_all;
use scc::HashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::ProviderConfig,
    error::{GatewayError, GatewayResult},
    ports::{ProviderFactory, SharedProvider},
};

/// Lowercase and trim a dependency id
pub fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}

struct Registration<H> {
    factory: Arc<dyn ProviderFactory<H>>,
    prefixes: Vec<String>,
    seq: u64,
}

struct Instance<H> {
    provider: SharedProvider<H>,
    healthy: bool,
    seq: u64,
}

/// Outcome of [`ProviderRegistry::initialize_all`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializationReport {
    /// Created and initialized successfully
    pub healthy: Vec<String>,
    /// Created, but initialization failed; cached as unhealthy
    pub unhealthy: Vec<String>,
    /// Creation failed: (id, error)
    pub failed: Vec<(String, String)>,
    /// Disabled in configuration
    pub skipped: Vec<String>,
}

impl InitializationReport {
    pub fn is_fully_healthy(&self) -> bool {
        self.unhealthy.is_empty() && self.failed.is_empty()
    }
}

/// Registry of dependency factories and live instances.
pub struct ProviderRegistry<H: Send + Sync + 'static> {
    registrations: HashMap<String, Registration<H>>,
    instances: HashMap<String, Instance<H>>,
    next_seq: AtomicU64,
}

impl<H: Send + Sync + 'static> Default for ProviderRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Send + Sync + 'static> ProviderRegistry<H> {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
            instances: HashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind `id` to a factory and optional static routing prefixes.
    ///
    /// Re-registering an id overwrites its factory and prefixes but keeps its
    /// position in registration order.
    pub async fn register_constructor<F, I, S>(&self, id: &str, factory: F, prefixes: I)
    where
        F: ProviderFactory<H>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = normalize_id(id);
        let factory: Arc<dyn ProviderFactory<H>> = Arc::new(factory);
        let prefixes: Vec<String> = prefixes
            .into_iter()
            .map(|p| p.into().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        match self.registrations.entry_async(id.clone()).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                let registration = occupied.get_mut();
                registration.factory = factory;
                registration.prefixes = prefixes;
                debug!(dependency = %id, "Replaced dependency factory");
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(Registration {
                    factory,
                    prefixes,
                    seq: self.next_seq(),
                });
                debug!(dependency = %id, "Registered dependency factory");
            }
        }
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.registrations
            .read_async(&normalize_id(id), |_, _| ())
            .await
            .is_some()
    }

    /// Registered ids in registration order
    pub async fn registered_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.registrations
            .retain_async(|id, registration| {
                ids.push((registration.seq, id.clone()));
                true
            })
            .await;
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Build a fresh instance with the bound factory.
    ///
    /// A missing factory is a miss (`Ok(None)`); a failing factory becomes
    /// [`GatewayError::DependencyCreation`].
    pub async fn create_provider(
        &self,
        id: &str,
        config: &ProviderConfig,
    ) -> GatewayResult<Option<SharedProvider<H>>> {
        let id = normalize_id(id);
        let Some(factory) = self
            .registrations
            .read_async(&id, |_, registration| Arc::clone(&registration.factory))
            .await
        else {
            debug!(dependency = %id, "No factory registered");
            return Ok(None);
        };

        factory
            .create(&id, config)
            .map(Some)
            .map_err(|e| GatewayError::DependencyCreation {
                dependency: id.clone(),
                message: format!("{e:#}"),
            })
    }

    /// Return the cached instance for `id`, creating and caching one if needed.
    ///
    /// The cache is keyed by id only: a different `config` for an id that is
    /// already cached is ignored until [`clear_cache`](Self::clear_cache).
    pub async fn create_cached_provider(
        &self,
        id: &str,
        config: &ProviderConfig,
    ) -> GatewayResult<SharedProvider<H>> {
        let id = normalize_id(id);
        if let Some(cached) = self.get_provider(&id).await {
            return Ok(cached);
        }

        let created = self.create_provider(&id, config).await?.ok_or_else(|| {
            GatewayError::DependencyCreation {
                dependency: id.clone(),
                message: "no factory registered".to_string(),
            }
        })?;
        let healthy = Self::run_initialize(&id, &created).await;
        let seq = self.registration_seq(&id).await;

        let winner = match self.instances.entry_async(id.clone()).await {
            scc::hash_map::Entry::Occupied(occupied) => Err(Arc::clone(&occupied.get().provider)),
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(Instance {
                    provider: Arc::clone(&created),
                    healthy,
                    seq,
                });
                Ok(())
            }
        };

        match winner {
            Ok(()) => {
                info!(dependency = %id, healthy, "Cached dependency instance");
                Ok(created)
            }
            Err(existing) => {
                // another caller cached one first
                Self::dispose_quietly(&id, &created).await;
                Ok(existing)
            }
        }
    }

    async fn registration_seq(&self, id: &str) -> u64 {
        match self
            .registrations
            .read_async(id, |_, registration| registration.seq)
            .await
        {
            Some(seq) => seq,
            None => self.next_seq(),
        }
    }

    async fn run_initialize(id: &str, provider: &SharedProvider<H>) -> bool {
        match provider.initialize().await {
            Ok(()) => true,
            Err(e) => {
                warn!(dependency = %id, error = %e, "Dependency initialization failed");
                false
            }
        }
    }

    async fn dispose_quietly(id: &str, provider: &SharedProvider<H>) {
        if let Err(e) = provider.dispose().await {
            warn!(dependency = %id, error = %e, "Failed to dispose dependency");
        }
    }

    /// Initialize `provider` and cache it under its own id, replacing any
    /// previous instance. Returns the recorded health flag.
    pub async fn register_instance(&self, provider: SharedProvider<H>) -> bool {
        let id = normalize_id(provider.id());
        let healthy = Self::run_initialize(&id, &provider).await;
        let seq = self.registration_seq(&id).await;

        let replaced = match self.instances.entry_async(id.clone()).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                let previous = std::mem::replace(
                    occupied.get_mut(),
                    Instance {
                        provider,
                        healthy,
                        seq,
                    },
                );
                // keep the registration position
                occupied.get_mut().seq = previous.seq;
                Some(previous.provider)
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(Instance {
                    provider,
                    healthy,
                    seq,
                });
                None
            }
        };

        if let Some(previous) = replaced {
            Self::dispose_quietly(&id, &previous).await;
        }
        info!(dependency = %id, healthy, "Registered dependency instance");
        healthy
    }

    pub async fn get_provider(&self, id: &str) -> Option<SharedProvider<H>> {
        self.instances
            .read_async(&normalize_id(id), |_, instance| Arc::clone(&instance.provider))
            .await
    }

    pub async fn is_healthy(&self, id: &str) -> Option<bool> {
        self.instances
            .read_async(&normalize_id(id), |_, instance| instance.healthy)
            .await
    }

    /// Update a cached instance's health flag; false if `id` is not cached.
    pub async fn set_health(&self, id: &str, healthy: bool) -> bool {
        let id = normalize_id(id);
        let updated = self
            .instances
            .update_async(&id, |_, instance| instance.healthy = healthy)
            .await
            .is_some();
        if updated {
            info!(dependency = %id, healthy, "Dependency health changed");
        }
        updated
    }

    /// Healthy instances serving `capability`, in registration order
    pub async fn get_providers_for_capability(&self, capability: &str) -> Vec<SharedProvider<H>> {
        let mut matches = Vec::new();
        self.instances
            .retain_async(|_, instance| {
                if instance.healthy
                    && instance
                        .provider
                        .capabilities()
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(capability))
                {
                    matches.push((instance.seq, Arc::clone(&instance.provider)));
                }
                true
            })
            .await;
        matches.sort_by_key(|(seq, _)| *seq);
        matches.into_iter().map(|(_, provider)| provider).collect()
    }

    pub async fn get_best_provider_for_capability(
        &self,
        capability: &str,
    ) -> Option<SharedProvider<H>> {
        self.get_providers_for_capability(capability)
            .await
            .into_iter()
            .next()
    }

    /// Resolve the dependency id serving `target`.
    ///
    /// Enabled dynamic config prefixes are scanned first (in config id order),
    /// then static registration prefixes (in registration order). The first
    /// case-insensitive prefix match wins.
    pub async fn get_provider_for_model(
        &self,
        target: &str,
        configs: Option<&BTreeMap<String, ProviderConfig>>,
    ) -> Option<String> {
        let target = target.to_lowercase();

        if let Some(configs) = configs {
            for (id, config) in configs {
                if !config.enabled {
                    continue;
                }
                if config
                    .model_prefixes
                    .iter()
                    .any(|p| !p.is_empty() && target.starts_with(&p.to_lowercase()))
                {
                    return Some(normalize_id(id));
                }
            }
        }

        let mut registered = Vec::new();
        self.registrations
            .retain_async(|id, registration| {
                if registration.prefixes.iter().any(|p| target.starts_with(p)) {
                    registered.push((registration.seq, id.clone()));
                }
                true
            })
            .await;
        registered.sort();
        registered.into_iter().next().map(|(_, id)| id)
    }

    /// Create and cache every enabled configured dependency concurrently.
    ///
    /// Failures are isolated: they are logged and reported, never propagated.
    pub async fn initialize_all(
        &self,
        configs: &BTreeMap<String, ProviderConfig>,
    ) -> InitializationReport {
        let mut report = InitializationReport::default();
        let mut pending = Vec::new();
        for (id, config) in configs {
            if config.enabled {
                pending.push((normalize_id(id), config));
            } else {
                report.skipped.push(normalize_id(id));
            }
        }

        let outcomes = join_all(pending.iter().map(|(id, config)| async move {
            let created = self.create_cached_provider(id, config).await;
            (id.clone(), created)
        }))
        .await;

        for (id, created) in outcomes {
            match created {
                Ok(_) => {
                    if self.is_healthy(&id).await.unwrap_or(false) {
                        report.healthy.push(id);
                    } else {
                        report.unhealthy.push(id);
                    }
                }
                Err(e) => {
                    warn!(dependency = %id, error = %e, "Failed to create dependency");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            healthy = report.healthy.len(),
            unhealthy = report.unhealthy.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Dependency initialization finished"
        );
        report
    }

    /// Dispose and forget every cached instance; registrations are kept.
    ///
    /// Returns the number of instances dropped.
    pub async fn clear_cache(&self) -> usize {
        let mut drained = Vec::new();
        self.instances
            .retain_async(|id, instance| {
                drained.push((id.clone(), Arc::clone(&instance.provider)));
                false
            })
            .await;
        let count = drained.len();
        for (id, provider) in drained {
            Self::dispose_quietly(&id, &provider).await;
        }
        count
    }

    /// Dispose every instance and drop every registration.
    pub async fn clear(&self) {
        let disposed = self.clear_cache().await;
        self.registrations.retain_async(|_, _| false).await;
        info!(disposed, "Dependency registry cleared");
    }
}
