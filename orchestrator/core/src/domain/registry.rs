// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry domain types: known clusters, discovered service endpoints and the
//! persisted membership document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::domain::cluster::{elapsed_since, AgentId, Cluster, ClusterId, ClusterStatus};

pub const SCORE_HEALTHY: f64 = 70.0;
pub const SCORE_DEGRADED: f64 = 40.0;
const FAST_GAIN: f64 = 0.3;
const SLOW_GAIN: f64 = 0.1;
const FAILURE_DECAY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    HttpApi,
    WebSocket,
    Database,
    GraphDatabase,
    Cache,
    MessageBroker,
    Metrics,
    AgentCluster,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Discovered,
    Healthy,
    Degraded,
    Unreachable,
    Offline,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointStatus::Discovered => "discovered",
            EndpointStatus::Healthy => "healthy",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Unreachable => "unreachable",
            EndpointStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// A reachable network service found by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub address: SocketAddr,
    pub protocol: String,
    pub kind: ServiceKind,
    pub status: EndpointStatus,
    /// Rolling score in `0.0..=100.0`.
    pub health_score: f64,
    pub cluster_id: Option<ClusterId>,
    pub last_seen: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub response_time_ms: Option<f64>,
}

impl ServiceEndpoint {
    pub fn discovered(address: SocketAddr, protocol: impl Into<String>, kind: ServiceKind, now: DateTime<Utc>) -> Self {
        Self {
            address,
            protocol: protocol.into(),
            kind,
            status: EndpointStatus::Discovered,
            health_score: 50.0,
            cluster_id: None,
            last_seen: now,
            last_health_check: None,
            response_time_ms: None,
        }
    }

    /// Folds one health-check result into the rolling score.
    ///
    /// Fast successes close 30% of the gap to 100, slow successes 10%,
    /// failures halve the score.
    pub fn record_check(&mut self, outcome: Option<Duration>, fast_threshold: Duration, now: DateTime<Utc>) {
        self.last_health_check = Some(now);
        match outcome {
            Some(elapsed) => {
                let gain = if elapsed <= fast_threshold { FAST_GAIN } else { SLOW_GAIN };
                self.health_score += (100.0 - self.health_score) * gain;
                self.response_time_ms = Some(elapsed.as_secs_f64() * 1000.0);
                self.last_seen = now;
            }
            None => {
                self.health_score *= FAILURE_DECAY;
                self.response_time_ms = None;
            }
        }
        self.health_score = self.health_score.clamp(0.0, 100.0);
        self.status = status_for_score(self.health_score);
    }

    pub fn mark_offline(&mut self, now: DateTime<Utc>) {
        self.status = EndpointStatus::Offline;
        self.last_health_check = Some(now);
    }

    /// Unreachable or offline, and last seen more than `max_age` before `now`.
    pub fn is_evictable(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        matches!(self.status, EndpointStatus::Unreachable | EndpointStatus::Offline)
            && elapsed_since(self.last_seen, now) > max_age
    }
}

pub fn status_for_score(score: f64) -> EndpointStatus {
    if score >= SCORE_HEALTHY {
        EndpointStatus::Healthy
    } else if score >= SCORE_DEGRADED {
        EndpointStatus::Degraded
    } else {
        EndpointStatus::Unreachable
    }
}

/// The registry's view of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRegistration {
    pub cluster_id: ClusterId,
    pub name: String,
    pub description: String,
    pub status: ClusterStatus,
    pub registered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub capabilities: BTreeSet<String>,
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Not persisted; endpoints are considered stale across restarts.
    #[serde(skip)]
    pub endpoints: Vec<SocketAddr>,
}

impl ClusterRegistration {
    pub fn from_cluster(cluster: &Cluster, now: DateTime<Utc>) -> Self {
        Self {
            cluster_id: cluster.id.clone(),
            name: cluster.name.clone(),
            description: cluster.description.clone(),
            status: cluster.status,
            registered_at: now,
            last_updated: now,
            capabilities: cluster.capabilities(),
            agents: cluster.agents().map(|slot| slot.id.clone()).collect(),
            metadata: cluster.metadata.clone(),
            endpoints: Vec::new(),
        }
    }

    /// Refreshes status, membership and heartbeat from the live cluster.
    pub fn refresh(&mut self, cluster: &Cluster, now: DateTime<Utc>) {
        self.name = cluster.name.clone();
        self.description = cluster.description.clone();
        self.status = cluster.status;
        self.capabilities = cluster.capabilities();
        self.agents = cluster.agents().map(|slot| slot.id.clone()).collect();
        self.metadata = cluster.metadata.clone();
        self.last_updated = now;
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_since(self.last_updated, now)
    }

    /// True while the last heartbeat is within `2 × heartbeat_interval`.
    pub fn is_active(&self, now: DateTime<Utc>, heartbeat_interval: Duration) -> bool {
        self.heartbeat_age(now) <= heartbeat_interval * 2
    }
}

/// Registry-level counters, persisted alongside the registrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub registrations: u64,
    pub unregistrations: u64,
    pub expired: u64,
    pub discovery_runs: u64,
    pub endpoints_discovered: u64,
    pub health_checks: u64,
    #[serde(default)]
    pub endpoints_evicted: u64,
}

/// Persisted membership document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub registrations: BTreeMap<ClusterId, ClusterRegistration>,
    pub metrics: RegistryMetrics,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::{AgentSlot, ClusterKind};

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint::discovered("127.0.0.1:8080".parse().unwrap(), "http", ServiceKind::HttpApi, Utc::now())
    }

    #[test]
    fn test_fast_success_raises_score_quickly() {
        let mut ep = endpoint();
        let fast = Duration::from_millis(200);
        ep.record_check(Some(Duration::from_millis(10)), fast, Utc::now());
        assert!((ep.health_score - 65.0).abs() < 1e-9);
        assert_eq!(ep.status, EndpointStatus::Degraded);
        ep.record_check(Some(Duration::from_millis(10)), fast, Utc::now());
        assert_eq!(ep.status, EndpointStatus::Healthy);
    }

    #[test]
    fn test_slow_success_raises_score_slowly() {
        let mut ep = endpoint();
        ep.record_check(Some(Duration::from_secs(1)), Duration::from_millis(200), Utc::now());
        assert!((ep.health_score - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_failures_halve_score_until_unreachable() {
        let mut ep = endpoint();
        ep.record_check(None, Duration::from_millis(200), Utc::now());
        assert_eq!(ep.health_score, 25.0);
        assert_eq!(ep.status, EndpointStatus::Unreachable);
    }

    #[test]
    fn test_registration_activity_window() {
        let now = Utc::now();
        let mut cluster = Cluster::new("core", "Core", ClusterKind::Core);
        cluster.register_agent(AgentSlot::new("a1", ["x"])).unwrap();
        let reg = ClusterRegistration::from_cluster(&cluster, now);
        assert!(reg.capabilities.contains("x"));
        assert_eq!(reg.agents, vec![AgentId::from("a1")]);

        let interval = Duration::from_secs(30);
        assert!(reg.is_active(now + chrono::Duration::seconds(60), interval));
        assert!(!reg.is_active(now + chrono::Duration::seconds(61), interval));
    }

    #[test]
    fn test_snapshot_omits_endpoints() {
        let now = Utc::now();
        let cluster = Cluster::new("core", "Core", ClusterKind::Core);
        let mut reg = ClusterRegistration::from_cluster(&cluster, now);
        reg.endpoints.push("127.0.0.1:1".parse().unwrap());
        let snapshot = RegistrySnapshot {
            registrations: BTreeMap::from([(reg.cluster_id.clone(), reg)]),
            metrics: RegistryMetrics::default(),
            saved_at: now,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        let entry = &value["registrations"]["core"];
        assert_eq!(entry["cluster_id"], "core");
        assert!(entry.get("endpoints").is_none());
        assert!(value.get("saved_at").is_some());
    }
}
