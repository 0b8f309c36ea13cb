// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cluster Aggregate
//!
//! A [`Cluster`] is a named, bounded pool of [`AgentSlot`]s. The cluster owns
//! slot membership and per-slot health, and decides which slot receives the
//! next unit of work.
//!
//! ## Status Derivation
//!
//! | Slot distribution | Status |
//! |-------------------|--------|
//! | no slots | `Inactive` |
//! | ≥ 80% of slots with health > 70 | `Active` |
//! | ≥ 50% of slots with health > 70 | `Degraded` |
//! | otherwise | `Failed` |
//!
//! Status is recomputed on every [`Cluster::health_check`]. Registering the
//! first slot starts the cluster; removing the last slot stops it.
//!
//! ## Cluster Kinds
//!
//! [`ClusterKind`] is a small catalog of per-kind defaults (capacity,
//! capability set, slot role). The AutoScaler uses [`ClusterKind::from_name`]
//! to decide which profile a newly created slot inherits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Health above which a slot counts as healthy for status derivation.
pub const HEALTHY_SLOT_THRESHOLD: f64 = 70.0;
/// Health above which a slot may accept work.
pub const AVAILABLE_SLOT_THRESHOLD: f64 = 50.0;
/// Health a slot is reset to when its cluster is restarted.
pub const RESTART_HEALTH: f64 = 80.0;

const STALE_PENALTY_PER_WINDOW: f64 = 10.0;
const ERROR_PENALTY: f64 = 5.0;
const SLOW_RESPONSE_PENALTY: f64 = 2.0;
const FAST_RESPONSE_RECOVERY: f64 = 1.0;
const HEARTBEAT_RECOVERY: f64 = 5.0;
const SLOW_RESPONSE_MS: f64 = 1000.0;

/// Unique identifier of a cluster (human-assigned, e.g. `"core"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier of an agent slot within the system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Offline,
    Starting,
    Online,
    Busy,
    Error,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Inactive,
    Starting,
    Active,
    Degraded,
    Failed,
    Stopping,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Inactive => "inactive",
            ClusterStatus::Starting => "starting",
            ClusterStatus::Active => "active",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Failed => "failed",
            ClusterStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Slot selection strategy applied by [`Cluster::select_best_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Oldest heartbeat first, approximating round-robin fairness.
    #[default]
    RoundRobin,
    LeastLoaded,
    HealthWeighted,
}

/// One unit of executable capacity within a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSlot {
    pub id: AgentId,
    pub role: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Quality signal in `0.0..=100.0`.
    pub health: f64,
    pub current_tasks: u32,
    pub max_tasks: u32,
    pub error_count: u64,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentSlot {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: AgentId::new(id),
            role: "worker".to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Online,
            health: 100.0,
            current_tasks: 0,
            max_tasks: 1,
            error_count: 0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_max_tasks(mut self, max_tasks: u32) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_health(mut self, health: f64) -> Self {
        self.health = health.clamp(0.0, 100.0);
        self
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Online
            && self.current_tasks < self.max_tasks
            && self.health > AVAILABLE_SLOT_THRESHOLD
    }

    pub fn is_healthy(&self) -> bool {
        self.health > HEALTHY_SLOT_THRESHOLD
    }

    /// Fraction of the task budget in use, `0.0..=1.0`.
    pub fn load(&self) -> f64 {
        if self.max_tasks == 0 {
            return 1.0;
        }
        self.current_tasks as f64 / self.max_tasks as f64
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.health = (self.health + HEARTBEAT_RECOVERY).min(100.0);
        if self.status == AgentStatus::Offline {
            self.status = AgentStatus::Online;
        }
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
        self.health = (self.health - ERROR_PENALTY).max(0.0);
        if self.health == 0.0 {
            self.status = AgentStatus::Error;
        }
    }

    pub fn record_latency(&mut self, latency_ms: f64) {
        if latency_ms > SLOW_RESPONSE_MS {
            self.health = (self.health - SLOW_RESPONSE_PENALTY).max(0.0);
        } else {
            self.health = (self.health + FAST_RESPONSE_RECOVERY).min(100.0);
        }
    }

    /// Caps health by the number of heartbeat windows missed since the last
    /// heartbeat. Repeated calls at the same instant are idempotent.
    pub fn decay(&mut self, now: DateTime<Utc>, heartbeat_window: Duration) {
        if heartbeat_window.is_zero() {
            return;
        }
        let elapsed = elapsed_since(self.last_heartbeat, now);
        let missed = (elapsed.as_secs_f64() / heartbeat_window.as_secs_f64()).floor();
        if missed < 1.0 {
            return;
        }
        let ceiling = (100.0 - STALE_PENALTY_PER_WINDOW * missed).max(0.0);
        self.health = self.health.min(ceiling);
        if ceiling == 0.0 {
            self.status = AgentStatus::Offline;
        }
    }

    fn begin_task(&mut self) {
        self.current_tasks += 1;
        if self.current_tasks >= self.max_tasks {
            self.status = AgentStatus::Busy;
        }
    }

    fn end_task(&mut self) {
        self.current_tasks = self.current_tasks.saturating_sub(1);
        if self.status == AgentStatus::Busy && self.current_tasks < self.max_tasks {
            self.status = AgentStatus::Online;
        }
    }
}

/// Rolling request metrics kept on the cluster itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
}

impl ClusterMetrics {
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let n = self.requests as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ClusterError {
    #[error("Cluster {cluster} is at capacity ({capacity} agents)")]
    CapacityExceeded { cluster: ClusterId, capacity: usize },

    #[error("Agent {0} is already registered")]
    DuplicateAgent(AgentId),

    #[error("Agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("Cluster {0} not found")]
    ClusterNotFound(ClusterId),

    #[error("Cluster {0} is already registered")]
    DuplicateCluster(ClusterId),
}

/// Catalog of cluster kinds with per-kind defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Core,
    Coordination,
    Memory,
    Learning,
    Communication,
    Generic,
}

/// Default profile for a [`ClusterKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterProfile {
    pub default_capacity: usize,
    pub role: &'static str,
    pub capabilities: &'static [&'static str],
}

impl ClusterKind {
    pub fn profile(self) -> ClusterProfile {
        match self {
            ClusterKind::Core => ClusterProfile {
                default_capacity: 10,
                role: "executor",
                capabilities: &["execution", "decision_making", "task_processing"],
            },
            ClusterKind::Coordination => ClusterProfile {
                default_capacity: 5,
                role: "coordinator",
                capabilities: &["coordination", "consensus", "voting"],
            },
            ClusterKind::Memory => ClusterProfile {
                default_capacity: 8,
                role: "memory",
                capabilities: &["storage", "retrieval", "knowledge"],
            },
            ClusterKind::Learning => ClusterProfile {
                default_capacity: 6,
                role: "learner",
                capabilities: &["learning", "pattern_detection", "analysis"],
            },
            ClusterKind::Communication => ClusterProfile {
                default_capacity: 4,
                role: "messenger",
                capabilities: &["messaging", "routing", "notification"],
            },
            ClusterKind::Generic => ClusterProfile {
                default_capacity: 10,
                role: "worker",
                capabilities: &["general"],
            },
        }
    }

    /// Infers the kind from a cluster id or name by naming convention.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let table: [(&str, ClusterKind); 7] = [
            ("core", ClusterKind::Core),
            ("coord", ClusterKind::Coordination),
            ("memory", ClusterKind::Memory),
            ("knowledge", ClusterKind::Memory),
            ("learn", ClusterKind::Learning),
            ("comm", ClusterKind::Communication),
            ("messag", ClusterKind::Communication),
        ];
        table
            .iter()
            .find(|(needle, _)| name.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or(ClusterKind::Generic)
    }
}

/// Aggregate root for a pool of agent slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub description: String,
    pub kind: ClusterKind,
    pub max_agents: usize,
    pub status: ClusterStatus,
    pub strategy: LoadBalancingStrategy,
    agents: BTreeMap<AgentId, AgentSlot>,
    pub metrics: ClusterMetrics,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    /// Creates an empty, inactive cluster using the kind's default capacity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ClusterKind) -> Self {
        Self {
            id: ClusterId::new(id),
            name: name.into(),
            description: String::new(),
            kind,
            max_agents: kind.profile().default_capacity,
            status: ClusterStatus::Inactive,
            strategy: LoadBalancingStrategy::default(),
            agents: BTreeMap::new(),
            metrics: ClusterMetrics::default(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_capacity(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ClusterStatus::Active
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentSlot> {
        self.agents.values()
    }

    pub fn agent(&self, id: &AgentId) -> Option<&AgentSlot> {
        self.agents.get(id)
    }

    pub fn agent_mut(&mut self, id: &AgentId) -> Option<&mut AgentSlot> {
        self.agents.get_mut(id)
    }

    /// Union of all capabilities advertised by the cluster's slots.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.agents
            .values()
            .flat_map(|slot| slot.capabilities.iter().cloned())
            .collect()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.agents.values().any(|slot| slot.capabilities.contains(capability))
    }

    /// Adds a slot. The first slot auto-starts the cluster.
    pub fn register_agent(&mut self, slot: AgentSlot) -> Result<(), ClusterError> {
        if self.agents.contains_key(&slot.id) {
            return Err(ClusterError::DuplicateAgent(slot.id));
        }
        if self.agents.len() >= self.max_agents {
            return Err(ClusterError::CapacityExceeded {
                cluster: self.id.clone(),
                capacity: self.max_agents,
            });
        }
        let was_empty = self.agents.is_empty();
        self.agents.insert(slot.id.clone(), slot);
        if was_empty {
            self.start();
        }
        Ok(())
    }

    /// Removes a slot. Removing the last slot auto-stops the cluster.
    pub fn unregister_agent(&mut self, id: &AgentId) -> Result<AgentSlot, ClusterError> {
        let slot = self
            .agents
            .remove(id)
            .ok_or_else(|| ClusterError::AgentNotFound(id.clone()))?;
        if self.agents.is_empty() {
            self.stop();
        }
        Ok(slot)
    }

    pub fn available_agents(&self) -> Vec<&AgentSlot> {
        self.agents.values().filter(|slot| slot.is_available()).collect()
    }

    pub fn has_available_agent(&self) -> bool {
        self.agents.values().any(AgentSlot::is_available)
    }

    /// Applies the configured strategy over the available slots.
    pub fn select_best_agent(&self) -> Option<AgentId> {
        let available = self.available_agents().into_iter();
        let chosen = match self.strategy {
            LoadBalancingStrategy::HealthWeighted => {
                available.max_by(|a, b| a.health.total_cmp(&b.health))
            }
            LoadBalancingStrategy::LeastLoaded => available.min_by_key(|slot| slot.current_tasks),
            LoadBalancingStrategy::RoundRobin => available.min_by_key(|slot| slot.last_heartbeat),
        };
        chosen.map(|slot| slot.id.clone())
    }

    /// Applies staleness decay to every slot and recomputes the status.
    pub fn health_check(&mut self, now: DateTime<Utc>, heartbeat_window: Duration) -> ClusterStatus {
        for slot in self.agents.values_mut() {
            slot.decay(now, heartbeat_window);
        }
        self.status = self.derived_status();
        self.status
    }

    /// Status implied by the current health distribution.
    pub fn derived_status(&self) -> ClusterStatus {
        if self.agents.is_empty() {
            return ClusterStatus::Inactive;
        }
        let ratio = self.healthy_ratio();
        if ratio >= 0.8 {
            ClusterStatus::Active
        } else if ratio >= 0.5 {
            ClusterStatus::Degraded
        } else {
            ClusterStatus::Failed
        }
    }

    fn healthy_ratio(&self) -> f64 {
        if self.agents.is_empty() {
            return 0.0;
        }
        let healthy = self.agents.values().filter(|slot| slot.is_healthy()).count();
        healthy as f64 / self.agents.len() as f64
    }

    /// Share of healthy slots in percent; `0.0` for an empty cluster.
    pub fn health_percentage(&self) -> f64 {
        self.healthy_ratio() * 100.0
    }

    /// Settles directly on `Active`, or `Inactive` when the cluster has no
    /// slots.
    pub fn start(&mut self) {
        self.status = if self.agents.is_empty() {
            ClusterStatus::Inactive
        } else {
            ClusterStatus::Active
        };
    }

    pub fn stop(&mut self) {
        self.status = ClusterStatus::Inactive;
    }

    /// Resets every slot to a fresh, online state and re-derives the status.
    pub fn restart(&mut self, now: DateTime<Utc>) -> ClusterStatus {
        self.stop();
        for slot in self.agents.values_mut() {
            slot.status = AgentStatus::Online;
            slot.health = slot.health.max(RESTART_HEALTH);
            slot.current_tasks = 0;
            slot.last_heartbeat = now;
        }
        self.start();
        self.status = self.derived_status();
        self.status
    }

    /// Marks the slot as running one more task. Returns `false` if the slot is
    /// unknown.
    pub fn begin_task(&mut self, id: &AgentId) -> bool {
        match self.agents.get_mut(id) {
            Some(slot) => {
                slot.begin_task();
                true
            }
            None => false,
        }
    }

    pub fn end_task(&mut self, id: &AgentId) {
        if let Some(slot) = self.agents.get_mut(id) {
            slot.end_task();
        }
    }

    pub fn total_tasks(&self) -> u32 {
        self.agents.values().map(|slot| slot.current_tasks).sum()
    }

    pub fn task_capacity(&self) -> u32 {
        self.agents.values().map(|slot| slot.max_tasks).sum()
    }
}

/// Non-negative wall-clock time between two instants.
pub fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}
