// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Orchestrator
//!
//! Coordination hub. Holds every [`Cluster`] together with one
//! [`CircuitBreaker`] and one [`LoadBalancingStats`] per cluster, the routing
//! rules, the failover redirect table and global metrics.
//!
//! ## Routing precedence
//!
//! 1. explicit target cluster, if `active`
//! 2. first `active` cluster whose slots advertise the requested capability
//! 3. first enabled [`RoutingRule`] (by priority) matching the serialized
//!    message, if its target exists
//! 4. first `active` cluster with an available slot
//!
//! While a primary is in failover, any step resolving to it is redirected to
//! its backup if the backup is `active`. For an explicit target this applies
//! even when the primary itself is no longer active.
//!
//! ## Locking
//!
//! All maps sit behind `parking_lot` locks that are never held across an
//! `.await`. Acquisition order is clusters, breakers, stats, metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitOpenError, CircuitState};
use crate::domain::cluster::{
    AgentId, AgentSlot, AgentStatus, Cluster, ClusterError, ClusterId, ClusterKind, ClusterStatus,
};
use crate::domain::config::{ConfigError, OrchestratorConfig};
use crate::domain::events::CoordinationEvent;
use crate::domain::message::Message;
use crate::domain::routing::{insert_sorted, RoutingError, RoutingRule};
use crate::domain::stats::{LoadBalancingStats, OrchestratorMetrics};
use crate::infrastructure::broker::MessageBroker;

/// The unit of work a slot performs for a message. Agent business logic is
/// supplied by the embedding application.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        cluster: &ClusterId,
        agent: &AgentId,
        message: &Message,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Executor that acknowledges every message without doing any work.
pub struct AcknowledgeExecutor;

#[async_trait]
impl TaskExecutor for AcknowledgeExecutor {
    async fn execute(
        &self,
        cluster: &ClusterId,
        agent: &AgentId,
        message: &Message,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "acknowledged": true,
            "message_id": message.id,
            "cluster_id": cluster,
            "agent_id": agent,
        }))
    }
}

/// Callbacks fired when a cluster of a given kind auto-starts (first slot
/// registered) or auto-stops (last slot removed).
pub trait ClusterLifecycleHook: Send + Sync {
    fn on_start(&self, cluster: &Cluster);
    fn on_stop(&self, cluster: &Cluster);
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    #[error("No cluster available for message")]
    NoClusterAvailable,

    #[error("Circuit breaker for cluster {cluster} is open (retry in {retry_after:?})")]
    CircuitOpen {
        cluster: ClusterId,
        retry_after: Duration,
    },

    #[error("No agent available in cluster {0}")]
    NoAgentAvailable(ClusterId),

    #[error("Cluster {0} disappeared while handling the message")]
    ClusterGone(ClusterId),

    #[error("Cluster {cluster} did not respond within {timeout:?}")]
    Timeout { cluster: ClusterId, timeout: Duration },

    #[error("Agent {agent} in cluster {cluster} failed: {reason}")]
    Execution {
        cluster: ClusterId,
        agent: AgentId,
        reason: String,
    },
}

impl SendError {
    /// Rejections by design, as opposed to failed calls.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SendError::CircuitOpen { .. } | SendError::NoClusterAvailable | SendError::NoAgentAvailable(_)
        )
    }
}

/// Result of [`Orchestrator::send_message`].
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<SendError>,
    pub cluster_id: Option<ClusterId>,
    pub agent_id: Option<AgentId>,
    pub latency_ms: f64,
}

impl SendOutcome {
    fn failed(cluster_id: Option<ClusterId>, agent_id: Option<AgentId>, error: SendError, latency_ms: f64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            cluster_id,
            agent_id,
            latency_ms,
        }
    }
}

/// Point-in-time load figures for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLoad {
    pub cluster_id: ClusterId,
    pub status: ClusterStatus,
    pub agent_count: usize,
    pub max_agents: usize,
    pub active_agents: usize,
    pub available_agents: usize,
    pub current_tasks: u32,
    pub task_capacity: u32,
    /// Share of the task budget in use, percent.
    pub load_percentage: f64,
    pub health_percentage: f64,
    pub average_latency_ms: f64,
    /// Percent.
    pub error_rate: f64,
}

/// Decrements the slot's task counter when dropped, whatever the outcome of
/// the call it brackets.
struct TaskLease<'a> {
    clusters: &'a RwLock<BTreeMap<ClusterId, Cluster>>,
    cluster: ClusterId,
    agent: AgentId,
}

impl Drop for TaskLease<'_> {
    fn drop(&mut self) {
        if let Some(cluster) = self.clusters.write().get_mut(&self.cluster) {
            cluster.end_task(&self.agent);
        }
    }
}

/// One breaker admission. Dropping it unsettled, as happens when the caller
/// abandons the send future, hands a half-open slot back to the breaker.
struct BreakerPermit<'a> {
    breakers: &'a Mutex<HashMap<ClusterId, CircuitBreaker>>,
    cluster: ClusterId,
    generation: u64,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Records the call outcome. Returns the new breaker state if it changed.
    fn settle(mut self, success: bool, now: DateTime<Utc>) -> Option<CircuitState> {
        self.settled = true;
        let mut breakers = self.breakers.lock();
        let breaker = breakers.get_mut(&self.cluster)?;
        let before = breaker.state();
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure(now);
        }
        let after = breaker.state();
        (before != after).then_some(after)
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(breaker) = self.breakers.lock().get_mut(&self.cluster) {
            breaker.release(self.generation);
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    clusters: RwLock<BTreeMap<ClusterId, Cluster>>,
    breakers: Mutex<HashMap<ClusterId, CircuitBreaker>>,
    stats: Mutex<HashMap<ClusterId, LoadBalancingStats>>,
    rules: RwLock<Vec<RoutingRule>>,
    redirects: RwLock<HashMap<ClusterId, ClusterId>>,
    metrics: Mutex<OrchestratorMetrics>,
    hooks: RwLock<HashMap<ClusterKind, Arc<dyn ClusterLifecycleHook>>>,
    executor: Arc<dyn TaskExecutor>,
    broker: Option<Arc<MessageBroker>>,
    shutdown_token: Mutex<CancellationToken>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clusters: RwLock::new(BTreeMap::new()),
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            redirects: RwLock::new(HashMap::new()),
            metrics: Mutex::new(OrchestratorMetrics::default()),
            hooks: RwLock::new(HashMap::new()),
            executor: Arc::new(AcknowledgeExecutor),
            broker: None,
            shutdown_token: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Coordination events are published through `broker`.
    pub fn with_broker(mut self, broker: Arc<MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn set_lifecycle_hook(&self, kind: ClusterKind, hook: Arc<dyn ClusterLifecycleHook>) {
        self.hooks.write().insert(kind, hook);
    }

    /// Publishes `event` through the attached broker. A no-op without one.
    pub async fn publish_event(&self, event: CoordinationEvent) {
        if let Some(broker) = &self.broker {
            broker.publish_event(event).await;
        }
    }

    // ---------------------------------------------------------------------
    // Cluster membership
    // ---------------------------------------------------------------------

    pub async fn register_cluster(&self, cluster: Cluster) -> Result<(), ClusterError> {
        let id = cluster.id.clone();
        {
            let mut clusters = self.clusters.write();
            if clusters.contains_key(&id) {
                return Err(ClusterError::DuplicateCluster(id));
            }
            info!(cluster_id = %id, kind = ?cluster.kind, agents = cluster.agent_count(), "Registering cluster");
            clusters.insert(id.clone(), cluster);
        }
        self.breakers
            .lock()
            .insert(id.clone(), CircuitBreaker::new(self.config.circuit_breaker.clone()));
        self.stats.lock().insert(id.clone(), LoadBalancingStats::default());
        metrics::gauge!("cohort_clusters").set(self.clusters.read().len() as f64);

        self.publish_event(CoordinationEvent::ClusterRegistered {
            cluster_id: id,
            registered_at: Utc::now(),
        })
        .await;
        Ok(())
    }

    /// Removes a cluster with its breaker, stats and any redirect involving it.
    pub async fn unregister_cluster(&self, id: &ClusterId) -> Result<Cluster, ClusterError> {
        let cluster = self
            .clusters
            .write()
            .remove(id)
            .ok_or_else(|| ClusterError::ClusterNotFound(id.clone()))?;
        self.breakers.lock().remove(id);
        self.stats.lock().remove(id);
        self.redirects
            .write()
            .retain(|primary, backup| primary != id && backup != id);
        info!(cluster_id = %id, "Cluster unregistered");
        metrics::gauge!("cohort_clusters").set(self.clusters.read().len() as f64);

        self.publish_event(CoordinationEvent::ClusterUnregistered {
            cluster_id: id.clone(),
            unregistered_at: Utc::now(),
        })
        .await;
        Ok(cluster)
    }

    pub async fn register_agent(&self, cluster_id: &ClusterId, slot: AgentSlot) -> Result<(), ClusterError> {
        let agent_id = slot.id.clone();
        let (before, after, snapshot) = self.with_cluster_mut(cluster_id, |cluster| {
            let before = cluster.status;
            cluster.register_agent(slot)?;
            Ok((before, cluster.status, cluster.clone()))
        })?;
        debug!(cluster_id = %cluster_id, agent_id = %agent_id, "Agent registered");

        if before == ClusterStatus::Inactive && after != ClusterStatus::Inactive {
            self.fire_hook(&snapshot, true);
        }
        self.emit_status_change(cluster_id, before, after).await;
        Ok(())
    }

    pub async fn unregister_agent(&self, cluster_id: &ClusterId, agent_id: &AgentId) -> Result<AgentSlot, ClusterError> {
        let (slot, before, after, snapshot) = self.with_cluster_mut(cluster_id, |cluster| {
            let before = cluster.status;
            let slot = cluster.unregister_agent(agent_id)?;
            Ok((slot, before, cluster.status, cluster.clone()))
        })?;
        debug!(cluster_id = %cluster_id, agent_id = %agent_id, "Agent unregistered");

        if before != ClusterStatus::Inactive && after == ClusterStatus::Inactive {
            self.fire_hook(&snapshot, false);
        }
        self.emit_status_change(cluster_id, before, after).await;
        Ok(slot)
    }

    pub fn heartbeat_agent(&self, cluster_id: &ClusterId, agent_id: &AgentId, now: DateTime<Utc>) -> Result<(), ClusterError> {
        self.with_cluster_mut(cluster_id, |cluster| {
            let slot = cluster
                .agent_mut(agent_id)
                .ok_or_else(|| ClusterError::AgentNotFound(agent_id.clone()))?;
            slot.heartbeat(now);
            Ok(())
        })
    }

    /// Overrides a slot's health score, e.g. from an external probe.
    pub fn set_agent_health(&self, cluster_id: &ClusterId, agent_id: &AgentId, health: f64) -> Result<(), ClusterError> {
        self.with_cluster_mut(cluster_id, |cluster| {
            let slot = cluster
                .agent_mut(agent_id)
                .ok_or_else(|| ClusterError::AgentNotFound(agent_id.clone()))?;
            slot.health = health.clamp(0.0, 100.0);
            if slot.health > 0.0 && slot.status == AgentStatus::Error {
                slot.status = AgentStatus::Online;
            }
            Ok(())
        })
    }

    fn with_cluster_mut<T>(
        &self,
        cluster_id: &ClusterId,
        f: impl FnOnce(&mut Cluster) -> Result<T, ClusterError>,
    ) -> Result<T, ClusterError> {
        let mut clusters = self.clusters.write();
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| ClusterError::ClusterNotFound(cluster_id.clone()))?;
        f(cluster)
    }

    fn fire_hook(&self, cluster: &Cluster, started: bool) {
        let hook = self.hooks.read().get(&cluster.kind).cloned();
        if let Some(hook) = hook {
            if started {
                hook.on_start(cluster);
            } else {
                hook.on_stop(cluster);
            }
        }
    }

    async fn emit_status_change(&self, cluster_id: &ClusterId, from: ClusterStatus, to: ClusterStatus) {
        if from == to {
            return;
        }
        info!(cluster_id = %cluster_id, %from, %to, "Cluster status changed");
        self.publish_event(CoordinationEvent::ClusterStatusChanged {
            cluster_id: cluster_id.clone(),
            from,
            to,
            changed_at: Utc::now(),
        })
        .await;
    }

    pub fn cluster(&self, id: &ClusterId) -> Option<Cluster> {
        self.clusters.read().get(id).cloned()
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters.read().values().cloned().collect()
    }

    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.clusters.read().keys().cloned().collect()
    }

    pub fn cluster_status(&self, id: &ClusterId) -> Option<ClusterStatus> {
        self.clusters.read().get(id).map(|c| c.status)
    }

    pub fn cluster_load(&self, id: &ClusterId) -> Option<ClusterLoad> {
        let clusters = self.clusters.read();
        let cluster = clusters.get(id)?;
        let stats = self.stats.lock().get(id).cloned().unwrap_or_default();
        let current_tasks = cluster.total_tasks();
        let task_capacity = cluster.task_capacity();
        let load_percentage = if task_capacity == 0 {
            0.0
        } else {
            current_tasks as f64 / task_capacity as f64 * 100.0
        };
        Some(ClusterLoad {
            cluster_id: id.clone(),
            status: cluster.status,
            agent_count: cluster.agent_count(),
            max_agents: cluster.max_agents,
            active_agents: cluster
                .agents()
                .filter(|s| matches!(s.status, AgentStatus::Online | AgentStatus::Busy))
                .count(),
            available_agents: cluster.available_agents().len(),
            current_tasks,
            task_capacity,
            load_percentage,
            health_percentage: cluster.health_percentage(),
            average_latency_ms: stats.average_latency_ms,
            error_rate: stats.error_rate(),
        })
    }

    // ---------------------------------------------------------------------
    // Routing
    // ---------------------------------------------------------------------

    pub fn add_routing_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        info!(rule_id = %rule.id, target = %rule.target_cluster, priority = rule.priority, "Adding routing rule");
        insert_sorted(&mut self.rules.write(), rule)
    }

    pub fn remove_routing_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.id != rule_id);
        rules.len() != before
    }

    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    /// Routes traffic for `primary` to `backup` while the backup is active.
    pub fn set_redirect(&self, primary: ClusterId, backup: ClusterId) {
        self.redirects.write().insert(primary, backup);
    }

    pub fn clear_redirect(&self, primary: &ClusterId) -> Option<ClusterId> {
        self.redirects.write().remove(primary)
    }

    pub fn redirect_for(&self, primary: &ClusterId) -> Option<ClusterId> {
        self.redirects.read().get(primary).cloned()
    }

    pub fn redirects(&self) -> HashMap<ClusterId, ClusterId> {
        self.redirects.read().clone()
    }

    /// Resolves the cluster that should handle `message`. `None` when nothing
    /// matches.
    pub fn route_message(
        &self,
        message: &Message,
        target_cluster: Option<&ClusterId>,
        target_capability: Option<&str>,
    ) -> Option<ClusterId> {
        let routed = {
            let clusters = self.clusters.read();
            let redirects = self.redirects.read();
            let active_backup = |id: &ClusterId| {
                redirects
                    .get(id)
                    .filter(|backup| clusters.get(*backup).is_some_and(Cluster::is_active))
                    .cloned()
            };
            let resolve = |id: &ClusterId| active_backup(id).unwrap_or_else(|| id.clone());

            let explicit = target_cluster.and_then(|target| {
                active_backup(target).or_else(|| {
                    clusters
                        .get(target)
                        .filter(|c| c.is_active())
                        .map(|c| c.id.clone())
                })
            });

            explicit
                .or_else(|| {
                    let capability = target_capability?;
                    clusters
                        .values()
                        .find(|c| c.is_active() && c.has_capability(capability))
                        .map(|c| resolve(&c.id))
                })
                .or_else(|| {
                    let rules = self.rules.read();
                    if rules.is_empty() {
                        return None;
                    }
                    let text = message.match_text();
                    rules
                        .iter()
                        .find(|rule| rule.matches(&text) && clusters.contains_key(&rule.target_cluster))
                        .map(|rule| resolve(&rule.target_cluster))
                })
                .or_else(|| {
                    clusters
                        .values()
                        .find(|c| c.is_active() && c.has_available_agent())
                        .map(|c| resolve(&c.id))
                })
        };

        if routed.is_none() {
            self.metrics.lock().routing_failures += 1;
            metrics::counter!("cohort_routing_failures_total").increment(1);
            debug!(message_id = %message.id, "No cluster available for message");
        }
        routed
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    pub async fn send_message(
        &self,
        message: Message,
        target_cluster: Option<&ClusterId>,
        target_capability: Option<&str>,
    ) -> SendOutcome {
        self.dispatch(message, target_cluster, target_capability, None).await
    }

    /// Like [`Self::send_message`], but the unit of work is abandoned after
    /// `timeout` and counted as a failure of the routed cluster.
    pub async fn send_message_with_timeout(
        &self,
        message: Message,
        target_cluster: Option<&ClusterId>,
        target_capability: Option<&str>,
        timeout: Duration,
    ) -> SendOutcome {
        self.dispatch(message, target_cluster, target_capability, Some(timeout)).await
    }

    async fn dispatch(
        &self,
        message: Message,
        target_cluster: Option<&ClusterId>,
        target_capability: Option<&str>,
        timeout: Option<Duration>,
    ) -> SendOutcome {
        let started = Instant::now();
        let Some(cluster_id) = self.route_message(&message, target_cluster, target_capability) else {
            return SendOutcome::failed(None, None, SendError::NoClusterAvailable, 0.0);
        };

        let permit = match self.admit(&cluster_id) {
            Ok(permit) => permit,
            Err(open) => {
                self.record_rejection(&cluster_id);
                self.metrics.lock().breaker_rejections += 1;
                metrics::counter!("cohort_breaker_rejections_total", "cluster" => cluster_id.to_string()).increment(1);
                debug!(cluster_id = %cluster_id, "Call rejected by open breaker");
                let error = SendError::CircuitOpen {
                    cluster: cluster_id.clone(),
                    retry_after: open.retry_after,
                };
                return SendOutcome::failed(Some(cluster_id), None, error, 0.0);
            }
        };

        let lease = match self.lease_agent(&cluster_id) {
            Ok(lease) => lease,
            Err(error) => {
                // capacity, not health: the breaker and failure counters stay untouched
                drop(permit);
                self.record_rejection(&cluster_id);
                debug!(cluster_id = %cluster_id, "Call rejected: {}", error);
                return SendOutcome::failed(Some(cluster_id), None, error, elapsed_ms(started));
            }
        };
        let agent_id = lease.agent.clone();

        let execution = self.executor.execute(&cluster_id, &agent_id, &message);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result.map_err(|e| SendError::Execution {
                    cluster: cluster_id.clone(),
                    agent: agent_id.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(SendError::Timeout {
                    cluster: cluster_id.clone(),
                    timeout: limit,
                }),
            },
            None => execution.await.map_err(|e| SendError::Execution {
                cluster: cluster_id.clone(),
                agent: agent_id.clone(),
                reason: e.to_string(),
            }),
        };
        drop(lease);

        let latency_ms = elapsed_ms(started);
        let success = result.is_ok();
        self.record_outcome(&cluster_id, &agent_id, permit, success, latency_ms).await;

        match result {
            Ok(value) => SendOutcome {
                success: true,
                result: Some(value),
                error: None,
                cluster_id: Some(cluster_id),
                agent_id: Some(agent_id),
                latency_ms,
            },
            Err(error) => {
                warn!(cluster_id = %cluster_id, agent_id = %agent_id, "Message handling failed: {}", error);
                SendOutcome::failed(Some(cluster_id), Some(agent_id), error, latency_ms)
            }
        }
    }

    fn admit(&self, cluster_id: &ClusterId) -> Result<BreakerPermit<'_>, CircuitOpenError> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(cluster_id.clone())
            .or_insert_with(|| CircuitBreaker::new(self.config.circuit_breaker.clone()));
        breaker.try_acquire(Utc::now())?;
        Ok(BreakerPermit {
            breakers: &self.breakers,
            cluster: cluster_id.clone(),
            generation: breaker.times_opened(),
            settled: false,
        })
    }

    fn record_rejection(&self, cluster_id: &ClusterId) {
        if let Some(stats) = self.stats.lock().get_mut(cluster_id) {
            stats.record_rejection();
        }
    }

    fn lease_agent(&self, cluster_id: &ClusterId) -> Result<TaskLease<'_>, SendError> {
        let mut clusters = self.clusters.write();
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| SendError::ClusterGone(cluster_id.clone()))?;
        let agent = cluster
            .select_best_agent()
            .ok_or_else(|| SendError::NoAgentAvailable(cluster_id.clone()))?;
        cluster.begin_task(&agent);
        Ok(TaskLease {
            clusters: &self.clusters,
            cluster: cluster_id.clone(),
            agent,
        })
    }

    async fn record_outcome(
        &self,
        cluster_id: &ClusterId,
        agent_id: &AgentId,
        permit: BreakerPermit<'_>,
        success: bool,
        latency_ms: f64,
    ) {
        let now = Utc::now();
        {
            let mut clusters = self.clusters.write();
            if let Some(cluster) = clusters.get_mut(cluster_id) {
                cluster.metrics.record(success, latency_ms);
                if let Some(slot) = cluster.agent_mut(agent_id) {
                    if success {
                        slot.record_latency(latency_ms);
                    } else {
                        slot.record_error();
                    }
                }
            }
        }

        let transition = permit.settle(success, now);

        if let Some(stats) = self.stats.lock().get_mut(cluster_id) {
            stats.record(success, latency_ms, now);
        }
        self.metrics.lock().record(success, latency_ms);

        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("cohort_requests_total", "cluster" => cluster_id.to_string(), "outcome" => outcome).increment(1);
        metrics::histogram!("cohort_request_latency_ms").record(latency_ms);

        if let Some(state) = transition {
            if state == CircuitState::Open {
                warn!(cluster_id = %cluster_id, "Circuit breaker opened");
                metrics::counter!("cohort_breaker_trips_total", "cluster" => cluster_id.to_string()).increment(1);
            } else {
                info!(cluster_id = %cluster_id, ?state, "Circuit breaker state changed");
            }
            self.publish_event(CoordinationEvent::BreakerStateChanged {
                cluster_id: cluster_id.clone(),
                state,
                changed_at: now,
            })
            .await;
        }
    }

    /// Discards the cluster's error-rate and latency sample.
    pub fn restart_stats_window(&self, cluster_id: &ClusterId) {
        if let Some(stats) = self.stats.lock().get_mut(cluster_id) {
            stats.restart_window();
        }
    }

    // ---------------------------------------------------------------------
    // Health and recovery
    // ---------------------------------------------------------------------

    /// Restarts a cluster's slots and resets its breaker.
    pub async fn restart_cluster(&self, cluster_id: &ClusterId) -> Result<ClusterStatus, ClusterError> {
        let now = Utc::now();
        let (before, after) = self.with_cluster_mut(cluster_id, |cluster| {
            let before = cluster.status;
            Ok((before, cluster.restart(now)))
        })?;
        if let Some(breaker) = self.breakers.lock().get_mut(cluster_id) {
            breaker.reset();
        }
        info!(cluster_id = %cluster_id, status = %after, "Cluster restarted");
        metrics::counter!("cohort_cluster_restarts_total").increment(1);

        self.publish_event(CoordinationEvent::ClusterRestarted {
            cluster_id: cluster_id.clone(),
            status: after,
            restarted_at: now,
        })
        .await;
        self.emit_status_change(cluster_id, before, after).await;
        Ok(after)
    }

    /// One health-check pass over every cluster. Returns the status of each
    /// cluster after the pass (and after any auto-recovery restart).
    pub async fn health_check_all(&self, now: DateTime<Utc>) -> Vec<(ClusterId, ClusterStatus)> {
        let window = self.config.agent_heartbeat_window;
        let observed: Vec<(ClusterId, ClusterStatus, ClusterStatus)> = {
            let mut clusters = self.clusters.write();
            clusters
                .values_mut()
                .map(|cluster| {
                    let before = cluster.status;
                    let after = cluster.health_check(now, window);
                    (cluster.id.clone(), before, after)
                })
                .collect()
        };

        let mut results = Vec::with_capacity(observed.len());
        for (id, before, after) in observed {
            self.emit_status_change(&id, before, after).await;
            let mut status = after;
            if after == ClusterStatus::Failed && self.config.auto_recovery {
                warn!(cluster_id = %id, "Cluster failed, attempting automatic recovery");
                match self.restart_cluster(&id).await {
                    Ok(restarted) => status = restarted,
                    Err(e) => warn!(cluster_id = %id, "Automatic recovery failed: {}", e),
                }
            }
            results.push((id, status));
        }
        results
    }

    /// Starts the health loop. Each start gets a fresh shutdown token, so a
    /// stopped orchestrator can be started again.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let shutdown = CancellationToken::new();
        *self.shutdown_token.lock() = shutdown.clone();
        self.running.store(true, Ordering::SeqCst);
        *self.started_at.lock() = Some(Utc::now());
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run_health_loop(shutdown).await })
    }

    pub fn stop(&self) {
        self.shutdown_token.lock().cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    async fn run_health_loop(&self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.health_check_interval,
            auto_recovery = self.config.auto_recovery,
            "Starting cluster health-check loop"
        );
        let mut tick = interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let results = self.health_check_all(Utc::now()).await;
                    debug!(clusters = results.len(), "Health-check cycle completed");
                }
                _ = shutdown.cancelled() => {
                    info!("Cluster health-check loop shutting down");
                    break;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Observability
    // ---------------------------------------------------------------------

    pub fn breaker_state(&self, cluster_id: &ClusterId) -> Option<CircuitState> {
        self.breakers.lock().get(cluster_id).map(CircuitBreaker::state)
    }

    pub fn breaker_snapshots(&self) -> BTreeMap<ClusterId, CircuitBreakerSnapshot> {
        self.breakers
            .lock()
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
            .collect()
    }

    pub fn stats(&self, cluster_id: &ClusterId) -> Option<LoadBalancingStats> {
        self.stats.lock().get(cluster_id).cloned()
    }

    pub fn all_stats(&self) -> BTreeMap<ClusterId, LoadBalancingStats> {
        self.stats
            .lock()
            .iter()
            .map(|(id, stats)| (id.clone(), stats.clone()))
            .collect()
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        self.metrics.lock().clone()
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::CircuitBreakerConfig;
    use crate::domain::message::MessageKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct FailingExecutor;

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self, _c: &ClusterId, _a: &AgentId, _m: &Message) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("agent crashed")
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute(&self, _c: &ClusterId, _a: &AgentId, _m: &Message) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!(null))
        }
    }

    #[derive(Default)]
    struct CountingHook {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ClusterLifecycleHook for CountingHook {
        fn on_start(&self, _cluster: &Cluster) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stop(&self, _cluster: &Cluster) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(threshold: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
            ..OrchestratorConfig::default()
        }
    }

    fn msg() -> Message {
        Message::new(MessageKind::Command, "test", json!({"op": "run"}))
    }

    async fn cluster_with_slots(orch: &Orchestrator, id: &str, slots: &[(&str, &[&str])]) {
        orch.register_cluster(Cluster::new(id, id, ClusterKind::Generic)).await.unwrap();
        for (agent, caps) in slots {
            orch.register_agent(&ClusterId::from(id), AgentSlot::new(*agent, caps.iter().copied()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_cluster_rejected() {
        let orch = Orchestrator::new(config(3)).unwrap();
        orch.register_cluster(Cluster::new("a", "A", ClusterKind::Core)).await.unwrap();
        let err = orch
            .register_cluster(Cluster::new("a", "A", ClusterKind::Core))
            .await
            .unwrap_err();
        assert_eq!(err, ClusterError::DuplicateCluster(ClusterId::from("a")));
    }

    #[tokio::test]
    async fn test_send_releases_task_counter_and_records_stats() {
        let orch = Orchestrator::new(config(3)).unwrap();
        cluster_with_slots(&orch, "a", &[("a1", &["x"])]).await;

        let outcome = orch.send_message(msg(), None, Some("x")).await;
        assert!(outcome.success);
        assert_eq!(outcome.cluster_id, Some(ClusterId::from("a")));
        assert_eq!(outcome.agent_id, Some(AgentId::from("a1")));
        assert_eq!(outcome.result.unwrap()["acknowledged"], true);

        let cluster = orch.cluster(&ClusterId::from("a")).unwrap();
        assert_eq!(cluster.total_tasks(), 0);
        let stats = orch.stats(&ClusterId::from("a")).unwrap();
        assert_eq!((stats.requests, stats.successes), (1, 1));
        assert_eq!(orch.metrics().successful_requests, 1);
    }

    #[tokio::test]
    async fn test_failures_open_breaker_and_reject_distinctly() {
        let orch = Orchestrator::new(config(2)).unwrap().with_executor(Arc::new(FailingExecutor));
        cluster_with_slots(&orch, "a", &[("a1", &["x"])]).await;
        let target = ClusterId::from("a");

        for _ in 0..2 {
            let outcome = orch.send_message(msg(), Some(&target), None).await;
            assert!(matches!(outcome.error, Some(SendError::Execution { .. })));
        }
        assert_eq!(orch.breaker_state(&target), Some(CircuitState::Open));
        // a task counter is never left behind
        assert_eq!(orch.cluster(&target).unwrap().total_tasks(), 0);

        let outcome = orch.send_message(msg(), Some(&target), None).await;
        let error = outcome.error.unwrap();
        assert!(matches!(error, SendError::CircuitOpen { .. }));
        assert!(error.is_rejection());
        assert_eq!(orch.metrics().breaker_rejections, 1);
        assert_eq!(orch.stats(&target).unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn test_no_cluster_available() {
        let orch = Orchestrator::new(config(3)).unwrap();
        let outcome = orch.send_message(msg(), None, None).await;
        assert_eq!(outcome.error, Some(SendError::NoClusterAvailable));
        assert_eq!(orch.metrics().routing_failures, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let orch = Orchestrator::new(config(5)).unwrap().with_executor(Arc::new(SlowExecutor));
        cluster_with_slots(&orch, "a", &[("a1", &[])]).await;

        let outcome = orch
            .send_message_with_timeout(msg(), None, None, Duration::from_millis(10))
            .await;
        assert!(matches!(outcome.error, Some(SendError::Timeout { .. })));
        let a = ClusterId::from("a");
        assert_eq!(orch.stats(&a).unwrap().failures, 1);
        assert_eq!(orch.cluster(&a).unwrap().total_tasks(), 0);
    }

    #[tokio::test]
    async fn test_rule_routing_after_capability() {
        let orch = Orchestrator::new(config(3)).unwrap();
        cluster_with_slots(&orch, "a", &[("a1", &[])]).await;
        cluster_with_slots(&orch, "billing", &[("b1", &[])]).await;
        orch.add_routing_rule(RoutingRule::new("r1", "invoice", "billing", 1).unwrap())
            .unwrap();

        let invoice = Message::new(MessageKind::Command, "x", json!({"kind": "invoice"}));
        assert_eq!(orch.route_message(&invoice, None, None), Some(ClusterId::from("billing")));
        // no rule match falls back to the first active cluster with a slot
        assert_eq!(orch.route_message(&msg(), None, None), Some(ClusterId::from("a")));

        assert!(orch.remove_routing_rule("r1"));
        assert_eq!(orch.route_message(&invoice, None, None), Some(ClusterId::from("a")));
    }

    #[tokio::test]
    async fn test_redirect_applies_to_explicit_target() {
        let orch = Orchestrator::new(config(3)).unwrap();
        cluster_with_slots(&orch, "primary", &[("p1", &["x"])]).await;
        cluster_with_slots(&orch, "backup", &[("b1", &["x"])]).await;
        let primary = ClusterId::from("primary");
        let backup = ClusterId::from("backup");

        orch.set_redirect(primary.clone(), backup.clone());
        assert_eq!(orch.route_message(&msg(), Some(&primary), None), Some(backup.clone()));

        // inactive backup: no redirect
        orch.unregister_agent(&backup, &AgentId::from("b1")).await.unwrap();
        assert_eq!(orch.route_message(&msg(), Some(&primary), None), Some(primary.clone()));

        orch.clear_redirect(&primary);
        assert!(orch.redirect_for(&primary).is_none());
    }

    #[tokio::test]
    async fn test_health_loop_recovers_failed_cluster() {
        let orch = Orchestrator::new(config(3)).unwrap();
        cluster_with_slots(&orch, "a", &[("a1", &[])]).await;
        let a = ClusterId::from("a");
        orch.set_agent_health(&a, &AgentId::from("a1"), 10.0).unwrap();

        let results = orch.health_check_all(Utc::now()).await;
        assert_eq!(results, vec![(a.clone(), ClusterStatus::Active)]);
        assert!(orch.cluster(&a).unwrap().agent(&AgentId::from("a1")).unwrap().health >= 80.0);
    }

    #[tokio::test]
    async fn test_without_auto_recovery_failed_cluster_stays_failed() {
        let mut cfg = config(3);
        cfg.auto_recovery = false;
        let orch = Orchestrator::new(cfg).unwrap();
        cluster_with_slots(&orch, "a", &[("a1", &[])]).await;
        let a = ClusterId::from("a");
        orch.set_agent_health(&a, &AgentId::from("a1"), 10.0).unwrap();
        assert_eq!(orch.health_check_all(Utc::now()).await, vec![(a, ClusterStatus::Failed)]);
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_fire_on_auto_start_and_stop() {
        let orch = Orchestrator::new(config(3)).unwrap();
        let hook = Arc::new(CountingHook::default());
        orch.set_lifecycle_hook(ClusterKind::Generic, hook.clone());

        cluster_with_slots(&orch, "a", &[("a1", &[]), ("a2", &[])]).await;
        assert_eq!(hook.starts.load(Ordering::SeqCst), 1);

        let a = ClusterId::from("a");
        orch.unregister_agent(&a, &AgentId::from("a1")).await.unwrap();
        assert_eq!(hook.stops.load(Ordering::SeqCst), 0);
        orch.unregister_agent(&a, &AgentId::from("a2")).await.unwrap();
        assert_eq!(hook.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_cluster_drops_redirects() {
        let orch = Orchestrator::new(config(3)).unwrap();
        cluster_with_slots(&orch, "a", &[("a1", &[])]).await;
        cluster_with_slots(&orch, "b", &[("b1", &[])]).await;
        orch.set_redirect(ClusterId::from("a"), ClusterId::from("b"));

        orch.unregister_cluster(&ClusterId::from("b")).await.unwrap();
        assert!(orch.redirects().is_empty());
        assert!(orch.breaker_state(&ClusterId::from("b")).is_none());
    }

    #[tokio::test]
    async fn test_cluster_load() {
        let orch = Orchestrator::new(config(3)).unwrap();
        cluster_with_slots(&orch, "a", &[("a1", &[]), ("a2", &[])]).await;
        let load = orch.cluster_load(&ClusterId::from("a")).unwrap();
        assert_eq!(load.agent_count, 2);
        assert_eq!(load.available_agents, 2);
        assert_eq!(load.load_percentage, 0.0);
        assert_eq!(load.health_percentage, 100.0);
    }

    #[tokio::test]
    async fn test_start_and_stop_health_loop() {
        let orch = Arc::new(Orchestrator::new(config(3)).unwrap());
        let handle = orch.start();
        assert!(orch.is_running());
        orch.stop();
        handle.await.unwrap();
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_health_loop_restarts_after_stop() {
        let orch = Arc::new(Orchestrator::new(config(3)).unwrap());
        orch.start();
        orch.stop();
        assert!(orch.shutdown_token().is_cancelled());

        let handle = orch.start();
        assert!(orch.is_running());
        assert!(!orch.shutdown_token().is_cancelled());
        orch.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_half_open_call_does_not_wedge_breaker() {
        let config = OrchestratorConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
                half_open_max_calls: 1,
            },
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::new(config).unwrap().with_executor(Arc::new(SlowExecutor));
        cluster_with_slots(&orch, "a", &[("a1", &["x"])]).await;
        let target = ClusterId::from("a");
        let limit = Duration::from_millis(10);

        let opened = orch.send_message_with_timeout(msg(), Some(&target), None, limit).await;
        assert!(matches!(opened.error, Some(SendError::Timeout { .. })));
        assert_eq!(orch.breaker_state(&target), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let abandoned = tokio::time::timeout(Duration::from_millis(30), orch.send_message(msg(), Some(&target), None)).await;
        assert!(abandoned.is_err());
        assert_eq!(orch.breaker_state(&target), Some(CircuitState::HalfOpen));
        assert_eq!(orch.breaker_snapshots()[&target].half_open_calls, 0);
        assert_eq!(orch.cluster(&target).unwrap().total_tasks(), 0);

        let retried = orch.send_message_with_timeout(msg(), Some(&target), None, limit).await;
        assert!(matches!(retried.error, Some(SendError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_a_rejection_not_a_failure() {
        let orch = Arc::new(Orchestrator::new(config(2)).unwrap().with_executor(Arc::new(SlowExecutor)));
        cluster_with_slots(&orch, "a", &[("a1", &["x"])]).await;
        let target = ClusterId::from("a");

        let busy = {
            let orch = orch.clone();
            let target = target.clone();
            tokio::spawn(async move { orch.send_message(msg(), Some(&target), None).await })
        };
        while orch.cluster(&target).unwrap().total_tasks() == 0 {
            tokio::task::yield_now().await;
        }

        for _ in 0..2 {
            let outcome = orch.send_message(msg(), Some(&target), None).await;
            let error = outcome.error.unwrap();
            assert_eq!(error, SendError::NoAgentAvailable(target.clone()));
            assert!(error.is_rejection());
        }
        let stats = orch.stats(&target).unwrap();
        assert_eq!((stats.failures, stats.rejected), (0, 2));
        assert_eq!(orch.breaker_state(&target), Some(CircuitState::Closed));
        assert_eq!(orch.metrics().failed_requests, 0);

        busy.abort();
        let _ = busy.await;
        assert_eq!(orch.cluster(&target).unwrap().total_tasks(), 0);
    }
}
