// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cluster Registry
//!
//! Membership and discovery service.
//!
//! - Tracks one [`ClusterRegistration`] per cluster. Re-registering refreshes
//!   the entry instead of failing.
//! - Discovers network endpoints through a [`ServiceProber`] and links them
//!   to clusters by detected service kind (`service_clusters` in
//!   [`RegistryConfig`]).
//! - Health-checks endpoints through a per-endpoint [`CircuitBreaker`].
//! - Purges registrations older than `max_missed_heartbeats ×
//!   heartbeat_interval`.
//! - Persists membership through a [`RegistryStore`] on stop and restores it
//!   on start. Endpoints are not persisted.
//!
//! Discovery, health checks and cleanup run as three independent loops.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::orchestrator::Orchestrator;
use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::cluster::{Cluster, ClusterError, ClusterId};
use crate::domain::config::{ConfigError, RegistryConfig};
use crate::domain::events::CoordinationEvent;
use crate::domain::registry::{ClusterRegistration, RegistryMetrics, RegistrySnapshot, ServiceEndpoint};
use crate::infrastructure::discovery::{NetworkProber, ServiceProber};
use crate::infrastructure::registry_store::{FileRegistryStore, RegistryStore, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cluster {0} is not registered")]
    NotRegistered(ClusterId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ClusterRegistry {
    config: RegistryConfig,
    prober: Arc<dyn ServiceProber>,
    store: Option<Arc<dyn RegistryStore>>,
    orchestrator: Option<Arc<Orchestrator>>,
    registrations: RwLock<BTreeMap<ClusterId, ClusterRegistration>>,
    endpoints: DashMap<SocketAddr, ServiceEndpoint>,
    endpoint_breakers: Mutex<HashMap<SocketAddr, CircuitBreaker>>,
    metrics: Mutex<RegistryMetrics>,
    shutdown_token: Mutex<CancellationToken>,
}

impl ClusterRegistry {
    pub fn new(config: RegistryConfig, prober: Arc<dyn ServiceProber>) -> Result<Self, RegistryError> {
        config.validate()?;
        Ok(Self {
            config,
            prober,
            store: None,
            orchestrator: None,
            registrations: RwLock::new(BTreeMap::new()),
            endpoints: DashMap::new(),
            endpoint_breakers: Mutex::new(HashMap::new()),
            metrics: Mutex::new(RegistryMetrics::default()),
            shutdown_token: Mutex::new(CancellationToken::new()),
        })
    }

    /// Registry backed by the network prober and, when `persistence_path` is
    /// set, the JSON file store.
    pub fn from_config(config: RegistryConfig) -> Result<Self, RegistryError> {
        let prober = Arc::new(NetworkProber::from_config(&config));
        let store = config
            .persistence_path
            .clone()
            .map(|path| Arc::new(FileRegistryStore::new(path)) as Arc<dyn RegistryStore>);
        let registry = Self::new(config, prober)?;
        Ok(match store {
            Some(store) => registry.with_store(store),
            None => registry,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Expired registrations are also unregistered from `orchestrator`.
    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    /// Creates or refreshes the registration for `cluster`.
    pub fn register(&self, cluster: &Cluster) -> ClusterRegistration {
        let now = Utc::now();
        let mut registrations = self.registrations.write();
        if let Some(existing) = registrations.get_mut(&cluster.id) {
            existing.refresh(cluster, now);
            debug!(cluster_id = %cluster.id, "Registration refreshed");
            return existing.clone();
        }

        let mut registration = ClusterRegistration::from_cluster(cluster, now);
        registration.endpoints = self.endpoints_for(&cluster.id);
        registrations.insert(cluster.id.clone(), registration.clone());
        self.metrics.lock().registrations += 1;
        metrics::gauge!("cohort_registered_clusters").set(registrations.len() as f64);
        info!(cluster_id = %cluster.id, capabilities = registration.capabilities.len(), "Cluster registered");
        registration
    }

    pub fn unregister(&self, cluster_id: &ClusterId) -> Result<ClusterRegistration, RegistryError> {
        let mut registrations = self.registrations.write();
        let removed = registrations
            .remove(cluster_id)
            .ok_or_else(|| RegistryError::NotRegistered(cluster_id.clone()))?;
        self.metrics.lock().unregistrations += 1;
        metrics::gauge!("cohort_registered_clusters").set(registrations.len() as f64);
        info!(cluster_id = %cluster_id, "Cluster unregistered");
        Ok(removed)
    }

    pub fn update_heartbeat(&self, cluster_id: &ClusterId) -> Result<(), RegistryError> {
        self.registrations
            .write()
            .get_mut(cluster_id)
            .map(|registration| registration.heartbeat(Utc::now()))
            .ok_or_else(|| RegistryError::NotRegistered(cluster_id.clone()))
    }

    /// Registration with its currently known endpoints.
    pub fn get_cluster_info(&self, cluster_id: &ClusterId) -> Option<ClusterRegistration> {
        let mut registration = self.registrations.read().get(cluster_id).cloned()?;
        registration.endpoints = self.endpoints_for(cluster_id);
        Some(registration)
    }

    pub fn registrations(&self) -> Vec<ClusterRegistration> {
        self.registrations.read().values().cloned().collect()
    }

    /// Registrations whose heartbeat is within twice the interval.
    pub fn active_registrations(&self, now: DateTime<Utc>) -> Vec<ClusterRegistration> {
        self.registrations
            .read()
            .values()
            .filter(|r| r.is_active(now, self.config.heartbeat_interval))
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        self.metrics.lock().clone()
    }

    fn endpoints_for(&self, cluster_id: &ClusterId) -> Vec<SocketAddr> {
        let mut addresses: Vec<SocketAddr> = self
            .endpoints
            .iter()
            .filter(|entry| entry.cluster_id.as_ref() == Some(cluster_id))
            .map(|entry| *entry.key())
            .collect();
        addresses.sort();
        addresses
    }

    // ---------------------------------------------------------------------
    // Discovery and endpoint health
    // ---------------------------------------------------------------------

    /// Scans the configured ranges. Known endpoints keep their health score;
    /// new ones start as `discovered`.
    pub async fn discover_services(&self) -> Vec<ServiceEndpoint> {
        let found = self
            .prober
            .discover(&self.config.scan_hosts, &self.config.scan_ports)
            .await;

        let mut fresh = 0u64;
        let mut discovered = Vec::with_capacity(found.len());
        for mut endpoint in found {
            endpoint.cluster_id = self.config.service_clusters.get(&endpoint.kind).cloned();
            let merged = match self.endpoints.entry(endpoint.address) {
                Entry::Occupied(mut occupied) => {
                    let known = occupied.get_mut();
                    known.kind = endpoint.kind;
                    known.protocol = endpoint.protocol;
                    known.cluster_id = endpoint.cluster_id;
                    known.last_seen = endpoint.last_seen;
                    known.clone()
                }
                Entry::Vacant(vacant) => {
                    fresh += 1;
                    vacant.insert(endpoint.clone());
                    endpoint
                }
            };
            discovered.push(merged);
        }

        {
            let mut registrations = self.registrations.write();
            for endpoint in &discovered {
                let Some(cluster_id) = &endpoint.cluster_id else { continue };
                if let Some(registration) = registrations.get_mut(cluster_id) {
                    if !registration.endpoints.contains(&endpoint.address) {
                        registration.endpoints.push(endpoint.address);
                    }
                }
            }
        }

        {
            let mut metrics = self.metrics.lock();
            metrics.discovery_runs += 1;
            metrics.endpoints_discovered += fresh;
        }
        metrics::gauge!("cohort_known_endpoints").set(self.endpoints.len() as f64);
        debug!(found = discovered.len(), new = fresh, "Service discovery completed");
        discovered
    }

    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        let mut endpoints: Vec<ServiceEndpoint> = self.endpoints.iter().map(|e| e.value().clone()).collect();
        endpoints.sort_by_key(|e| e.address);
        endpoints
    }

    /// Checks every known endpoint once. Endpoints behind an open breaker are
    /// marked offline without being probed. Returns the number probed.
    pub async fn health_check_endpoints(&self, now: DateTime<Utc>) -> usize {
        let snapshot: Vec<ServiceEndpoint> = self.endpoints.iter().map(|e| e.value().clone()).collect();

        let mut to_probe = Vec::new();
        {
            let mut breakers = self.endpoint_breakers.lock();
            for endpoint in snapshot {
                let breaker = breakers
                    .entry(endpoint.address)
                    .or_insert_with(|| CircuitBreaker::new(self.config.endpoint_breaker.clone()));
                if breaker.try_acquire(now).is_ok() {
                    to_probe.push(endpoint);
                } else if let Some(mut known) = self.endpoints.get_mut(&endpoint.address) {
                    known.mark_offline(now);
                }
            }
        }

        let outcomes = join_all(to_probe.iter().map(|endpoint| async move {
            let outcome = self.prober.check(endpoint).await;
            (endpoint.address, outcome)
        }))
        .await;

        let probed = outcomes.len();
        {
            let mut breakers = self.endpoint_breakers.lock();
            for (address, outcome) in outcomes {
                let latency = match outcome {
                    Ok(latency) => Some(latency),
                    Err(e) => {
                        debug!(%address, "Endpoint health check failed: {}", e);
                        None
                    }
                };
                if let Some(breaker) = breakers.get_mut(&address) {
                    if latency.is_some() {
                        breaker.record_success();
                    } else {
                        breaker.record_failure(now);
                    }
                }
                if let Some(mut known) = self.endpoints.get_mut(&address) {
                    known.record_check(latency, self.config.fast_response_threshold, now);
                }
            }
        }
        self.metrics.lock().health_checks += probed as u64;
        self.evict_dead_endpoints(now);
        probed
    }

    /// Forgets endpoints that stayed unreachable or offline past the
    /// eviction age, together with their breakers. Returns their addresses.
    pub fn evict_dead_endpoints(&self, now: DateTime<Utc>) -> Vec<SocketAddr> {
        let max_age = self.config.endpoint_eviction_age;
        let mut evicted = Vec::new();
        self.endpoints.retain(|address, endpoint| {
            let keep = !endpoint.is_evictable(now, max_age);
            if !keep {
                evicted.push(*address);
            }
            keep
        });
        if evicted.is_empty() {
            return evicted;
        }

        {
            let mut breakers = self.endpoint_breakers.lock();
            for address in &evicted {
                breakers.remove(address);
            }
        }
        for registration in self.registrations.write().values_mut() {
            registration.endpoints.retain(|address| !evicted.contains(address));
        }
        self.metrics.lock().endpoints_evicted += evicted.len() as u64;
        metrics::gauge!("cohort_known_endpoints").set(self.endpoints.len() as f64);
        info!(count = evicted.len(), "Evicted dead service endpoints");
        evicted
    }

    // ---------------------------------------------------------------------
    // Expiry
    // ---------------------------------------------------------------------

    /// Removes registrations older than the expiry age. Returns their ids.
    pub async fn cleanup_stale(&self, now: DateTime<Utc>) -> Vec<ClusterId> {
        let expiry = self.config.expiry_age();
        let expired: Vec<ClusterId> = {
            let mut registrations = self.registrations.write();
            let stale: Vec<ClusterId> = registrations
                .values()
                .filter(|r| r.heartbeat_age(now) > expiry)
                .map(|r| r.cluster_id.clone())
                .collect();
            for id in &stale {
                registrations.remove(id);
            }
            stale
        };
        if expired.is_empty() {
            return expired;
        }

        self.metrics.lock().expired += expired.len() as u64;
        metrics::counter!("cohort_registrations_expired_total").increment(expired.len() as u64);
        for id in &expired {
            warn!(cluster_id = %id, "Registration expired after missed heartbeats");
            let Some(orchestrator) = &self.orchestrator else { continue };
            match orchestrator.unregister_cluster(id).await {
                Ok(_) | Err(ClusterError::ClusterNotFound(_)) => {}
                Err(e) => warn!(cluster_id = %id, "Failed to unregister expired cluster: {}", e),
            }
            orchestrator
                .publish_event(CoordinationEvent::RegistrationExpired {
                    cluster_id: id.clone(),
                    expired_at: now,
                })
                .await;
        }
        expired
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            registrations: self.registrations.read().clone(),
            metrics: self.metrics(),
            saved_at: Utc::now(),
        }
    }

    pub async fn persist(&self) -> Result<(), RegistryError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        store.save(&snapshot).await?;
        info!(registrations = snapshot.registrations.len(), "Registry state persisted");
        Ok(())
    }

    /// Loads persisted registrations, giving each a fresh heartbeat. Returns
    /// how many were restored.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(snapshot) = store.load().await? else {
            return Ok(0);
        };
        let now = Utc::now();
        let restored = snapshot.registrations.len();
        {
            let mut registrations = self.registrations.write();
            for (id, mut registration) in snapshot.registrations {
                registration.endpoints.clear();
                registration.heartbeat(now);
                registrations.insert(id, registration);
            }
        }
        *self.metrics.lock() = snapshot.metrics;
        info!(restored, "Registry state restored");
        Ok(restored)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Restores persisted state and spawns the discovery, health-check and
    /// cleanup loops. A corrupt or unreadable store is logged and skipped.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.restore().await {
            warn!("Failed to restore registry state: {}", e);
        }
        info!(
            hosts = self.config.scan_hosts.len(),
            port_ranges = self.config.scan_ports.len(),
            "Starting cluster registry"
        );
        let shutdown = CancellationToken::new();
        *self.shutdown_token.lock() = shutdown.clone();
        vec![
            self.spawn_loop("discovery", self.config.discovery_interval, &shutdown, |registry| async move {
                registry.discover_services().await;
            }),
            self.spawn_loop("endpoint health", self.config.health_check_interval, &shutdown, |registry| async move {
                registry.health_check_endpoints(Utc::now()).await;
            }),
            self.spawn_loop("cleanup", self.config.heartbeat_interval, &shutdown, |registry| async move {
                registry.cleanup_stale(Utc::now()).await;
            }),
        ]
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        shutdown: &CancellationToken,
        cycle: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registry = self.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => cycle(registry.clone()).await,
                    _ = shutdown.cancelled() => {
                        debug!(task = name, "Registry loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stops the loops and persists membership.
    pub async fn stop(&self) -> Result<(), RegistryError> {
        self.shutdown_token.lock().cancel();
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::{AgentSlot, ClusterKind};
    use crate::domain::config::PortRange;
    use crate::domain::registry::{EndpointStatus, ServiceKind};
    use crate::infrastructure::discovery::ProbeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Reports a fixed endpoint set; health checks fail while `down` is set.
    struct FakeProber {
        endpoints: Vec<ServiceEndpoint>,
        down: AtomicBool,
        checks: AtomicUsize,
    }

    impl FakeProber {
        fn new(endpoints: Vec<ServiceEndpoint>) -> Self {
            Self {
                endpoints,
                down: AtomicBool::new(false),
                checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ServiceProber for FakeProber {
        async fn discover(&self, _hosts: &[String], _ports: &[PortRange]) -> Vec<ServiceEndpoint> {
            self.endpoints.clone()
        }

        async fn check(&self, endpoint: &ServiceEndpoint) -> Result<Duration, ProbeError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(ProbeError::Timeout {
                    address: endpoint.address,
                })
            } else {
                Ok(Duration::from_millis(5))
            }
        }
    }

    fn cluster(id: &str) -> Cluster {
        let mut cluster = Cluster::new(id, id, ClusterKind::Memory);
        cluster.register_agent(AgentSlot::new("a1", ["storage"])).unwrap();
        cluster
    }

    fn registry_with(prober: Arc<FakeProber>, config: RegistryConfig) -> ClusterRegistry {
        ClusterRegistry::new(config, prober).unwrap()
    }

    #[test]
    fn test_reregistration_refreshes() {
        let registry = registry_with(Arc::new(FakeProber::new(vec![])), RegistryConfig::default());
        registry.register(&cluster("memory"));
        let again = registry.register(&cluster("memory"));
        assert_eq!(registry.registrations().len(), 1);
        assert_eq!(registry.metrics().registrations, 1);
        assert!(again.capabilities.contains("storage"));
    }

    #[test]
    fn test_unknown_cluster_heartbeat_fails() {
        let registry = registry_with(Arc::new(FakeProber::new(vec![])), RegistryConfig::default());
        assert!(matches!(
            registry.update_heartbeat(&ClusterId::from("ghost")),
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_purges_after_missed_heartbeats() {
        let registry = registry_with(Arc::new(FakeProber::new(vec![])), RegistryConfig::default());
        registry.register(&cluster("memory"));

        let soon = Utc::now() + chrono::Duration::seconds(45);
        assert!(registry.cleanup_stale(soon).await.is_empty());
        assert_eq!(registry.active_registrations(soon).len(), 1);

        // default expiry: 3 × 30s
        let late = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.cleanup_stale(late).await, vec![ClusterId::from("memory")]);
        assert!(registry.get_cluster_info(&ClusterId::from("memory")).is_none());
        assert_eq!(registry.metrics().expired, 1);
    }

    #[tokio::test]
    async fn test_discovery_links_endpoints_to_clusters() {
        let address: SocketAddr = "10.0.0.5:6379".parse().unwrap();
        let endpoint = ServiceEndpoint::discovered(address, "tcp", ServiceKind::Cache, Utc::now());
        let mut config = RegistryConfig::default();
        config
            .service_clusters
            .insert(ServiceKind::Cache, ClusterId::from("memory"));
        let registry = registry_with(Arc::new(FakeProber::new(vec![endpoint])), config);
        registry.register(&cluster("memory"));

        let found = registry.discover_services().await;
        assert_eq!(found[0].cluster_id, Some(ClusterId::from("memory")));
        let info = registry.get_cluster_info(&ClusterId::from("memory")).unwrap();
        assert_eq!(info.endpoints, vec![address]);

        registry.discover_services().await;
        assert_eq!(registry.metrics().endpoints_discovered, 1);
        assert_eq!(registry.metrics().discovery_runs, 2);
    }

    #[tokio::test]
    async fn test_endpoint_breaker_marks_offline_and_skips_probe() {
        let address: SocketAddr = "10.0.0.9:8080".parse().unwrap();
        let endpoint = ServiceEndpoint::discovered(address, "http", ServiceKind::HttpApi, Utc::now());
        let prober = Arc::new(FakeProber::new(vec![endpoint]));
        let mut config = RegistryConfig::default();
        config.endpoint_breaker.failure_threshold = 2;
        let registry = registry_with(prober.clone(), config);
        registry.discover_services().await;

        let now = Utc::now();
        assert_eq!(registry.health_check_endpoints(now).await, 1);
        // 50 + 30% of the gap
        assert_eq!(registry.endpoints()[0].status, EndpointStatus::Degraded);

        prober.down.store(true, Ordering::SeqCst);
        registry.health_check_endpoints(now).await;
        registry.health_check_endpoints(now).await;
        let probes_before = prober.checks.load(Ordering::SeqCst);

        assert_eq!(registry.health_check_endpoints(now).await, 0);
        assert_eq!(prober.checks.load(Ordering::SeqCst), probes_before);
        assert_eq!(registry.endpoints()[0].status, EndpointStatus::Offline);
    }

    #[tokio::test]
    async fn test_cleanup_unregisters_from_orchestrator() {
        let orch = Arc::new(Orchestrator::new(Default::default()).unwrap());
        orch.register_cluster(cluster("memory")).await.unwrap();
        let registry = registry_with(Arc::new(FakeProber::new(vec![])), RegistryConfig::default())
            .with_orchestrator(orch.clone());
        registry.register(&orch.cluster(&ClusterId::from("memory")).unwrap());

        registry
            .cleanup_stale(Utc::now() + chrono::Duration::minutes(10))
            .await;
        assert!(orch.cluster(&ClusterId::from("memory")).is_none());
    }

    #[tokio::test]
    async fn test_stop_persists_and_start_restores() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = RegistryConfig::default();
        config.persistence_path = Some(dir.path().join("registry.json"));

        let first = Arc::new(ClusterRegistry::from_config(config.clone()).unwrap());
        first.register(&cluster("memory"));
        first.stop().await.unwrap();

        let second = Arc::new(ClusterRegistry::from_config(config).unwrap());
        let handles = second.start().await;
        let info = second.get_cluster_info(&ClusterId::from("memory")).unwrap();
        assert!(info.capabilities.contains("storage"));
        assert!(info.endpoints.is_empty());
        assert!(info.is_active(Utc::now(), second.config().heartbeat_interval));

        second.stop().await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dead_endpoint_is_evicted_after_max_age() {
        let now = Utc::now();
        let address: SocketAddr = "10.0.0.7:6379".parse().unwrap();
        let endpoint = ServiceEndpoint::discovered(address, "tcp", ServiceKind::Cache, now);
        let prober = Arc::new(FakeProber::new(vec![endpoint]));
        let config = RegistryConfig {
            endpoint_eviction_age: Duration::from_secs(60),
            service_clusters: HashMap::from([(ServiceKind::Cache, ClusterId::from("memory"))]),
            ..RegistryConfig::default()
        };
        let registry = registry_with(prober.clone(), config);
        registry.register(&cluster("memory"));
        registry.discover_services().await;
        prober.down.store(true, Ordering::SeqCst);

        // unreachable but recently seen
        registry.health_check_endpoints(now).await;
        assert_eq!(registry.endpoints()[0].status, EndpointStatus::Unreachable);

        let later = now + chrono::Duration::minutes(2);
        registry.health_check_endpoints(later).await;
        assert!(registry.endpoints().is_empty());
        assert!(registry.endpoint_breakers.lock().is_empty());
        assert!(registry.registrations()[0].endpoints.is_empty());
        assert_eq!(registry.metrics().endpoints_evicted, 1);

        let probes = prober.checks.load(Ordering::SeqCst);
        registry.health_check_endpoints(later).await;
        assert_eq!(prober.checks.load(Ordering::SeqCst), probes);
    }
}
