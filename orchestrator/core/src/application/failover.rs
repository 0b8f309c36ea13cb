// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # FailoverManager
//!
//! Watches clusters that have a [`FailoverPolicy`] and redirects their
//! traffic to a backup when a threshold is crossed.
//!
//! ```text
//!   normal ──trigger──▶ in failover ──health ≥ failback threshold──▶ normal
//!     ▲                     │ (auto_failback)
//!     └──trigger_failback───┘
//! ```
//!
//! While a cluster is in failover it is evaluated only for failback. The
//! redirect itself lives in the [`Orchestrator`] routing table.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::orchestrator::Orchestrator;
use crate::domain::cluster::{elapsed_since, ClusterId, ClusterStatus};
use crate::domain::config::{ConfigError, FailoverConfig};
use crate::domain::events::CoordinationEvent;
use crate::domain::failover::{
    evaluate_trigger, ActiveFailover, ClusterCondition, FailoverEvent, FailoverKind, FailoverPolicy,
    FailoverTrigger,
};

#[derive(Debug, Error, PartialEq)]
pub enum FailoverError {
    #[error("No failover policy for cluster {0}")]
    NoPolicy(ClusterId),

    #[error("Cluster {0} is already in failover")]
    AlreadyInFailover(ClusterId),

    #[error("Cluster {0} is not in failover")]
    NotInFailover(ClusterId),
}

pub struct FailoverManager {
    config: FailoverConfig,
    orchestrator: Arc<Orchestrator>,
    policies: RwLock<HashMap<ClusterId, FailoverPolicy>>,
    active: RwLock<HashMap<ClusterId, ActiveFailover>>,
    events: Mutex<VecDeque<FailoverEvent>>,
    shutdown_token: Mutex<CancellationToken>,
}

impl FailoverManager {
    pub fn new(config: FailoverConfig, orchestrator: Arc<Orchestrator>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            orchestrator,
            policies: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            shutdown_token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn set_failover_policy(&self, policy: FailoverPolicy) -> Result<(), ConfigError> {
        policy.validate()?;
        info!(
            cluster_id = %policy.cluster_id,
            backups = policy.backup_clusters.len(),
            "Failover policy set"
        );
        self.policies.write().insert(policy.cluster_id.clone(), policy);
        Ok(())
    }

    pub fn remove_failover_policy(&self, cluster_id: &ClusterId) -> Option<FailoverPolicy> {
        self.policies.write().remove(cluster_id)
    }

    pub fn failover_policy(&self, cluster_id: &ClusterId) -> Option<FailoverPolicy> {
        self.policies.read().get(cluster_id).cloned()
    }

    pub fn is_in_failover(&self, cluster_id: &ClusterId) -> bool {
        self.active.read().contains_key(cluster_id)
    }

    pub fn active_failovers(&self) -> Vec<ActiveFailover> {
        self.active.read().values().cloned().collect()
    }

    fn condition(&self, cluster_id: &ClusterId) -> Option<ClusterCondition> {
        let load = self.orchestrator.cluster_load(cluster_id)?;
        Some(ClusterCondition {
            status: load.status,
            health_percentage: load.health_percentage,
            average_latency_ms: load.average_latency_ms,
            error_rate: load.error_rate,
        })
    }

    /// One monitoring pass over every enabled policy. Returns the events
    /// recorded during the pass.
    pub async fn check_cycle(&self, now: DateTime<Utc>) -> Vec<FailoverEvent> {
        let policies: Vec<FailoverPolicy> = self
            .policies
            .read()
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();

        let mut recorded = Vec::new();
        for policy in policies {
            let id = &policy.cluster_id;
            let Some(condition) = self.condition(id) else {
                debug!(cluster_id = %id, "Failover policy refers to an unknown cluster");
                continue;
            };

            let active = self.active.read().get(id).cloned();
            if let Some(active) = active {
                let recovered = condition.health_percentage >= policy.failback_health_threshold
                    && evaluate_trigger(&policy, &condition).is_none();
                if policy.auto_failback && recovered {
                    let reason = format!("health recovered to {:.1}%", condition.health_percentage);
                    if let Some(event) = self.fail_back(id, active.trigger, reason, now).await {
                        recorded.push(event);
                    }
                }
                continue;
            }

            if let Some(trigger) = evaluate_trigger(&policy, &condition) {
                let reason = describe(trigger, &condition);
                recorded.push(self.fail_over(&policy, trigger, reason, now).await);
            }
        }
        recorded
    }

    /// Forces a failover regardless of thresholds.
    pub async fn trigger_failover(&self, cluster_id: &ClusterId, reason: &str) -> Result<FailoverEvent, FailoverError> {
        let policy = self
            .policies
            .read()
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| FailoverError::NoPolicy(cluster_id.clone()))?;
        if self.is_in_failover(cluster_id) {
            return Err(FailoverError::AlreadyInFailover(cluster_id.clone()));
        }
        Ok(self
            .fail_over(&policy, FailoverTrigger::Manual, reason.to_string(), Utc::now())
            .await)
    }

    pub async fn trigger_failback(&self, cluster_id: &ClusterId) -> Result<FailoverEvent, FailoverError> {
        self.fail_back(cluster_id, FailoverTrigger::Manual, "manual failback".into(), Utc::now())
            .await
            .ok_or_else(|| FailoverError::NotInFailover(cluster_id.clone()))
    }

    async fn fail_over(
        &self,
        policy: &FailoverPolicy,
        trigger: FailoverTrigger,
        reason: String,
        now: DateTime<Utc>,
    ) -> FailoverEvent {
        let primary = &policy.cluster_id;
        let backup = policy
            .backup_clusters
            .iter()
            .find(|b| self.orchestrator.cluster_status(b) == Some(ClusterStatus::Active))
            .cloned();

        let mut event = FailoverEvent {
            id: Uuid::new_v4(),
            kind: FailoverKind::Failover,
            primary_cluster: primary.clone(),
            backup_cluster: backup.clone(),
            trigger,
            reason,
            success: false,
            error: None,
            recovery_duration: None,
            timestamp: now,
        };

        let Some(backup) = backup else {
            warn!(cluster_id = %primary, %trigger, "Failover needed but no backup cluster is active");
            event.error = Some("no active backup cluster available".into());
            self.record_event(event.clone());
            return event;
        };

        self.orchestrator.set_redirect(primary.clone(), backup.clone());
        // the primary is judged on traffic it serves after the failover
        self.orchestrator.restart_stats_window(primary);
        self.active.write().insert(
            primary.clone(),
            ActiveFailover {
                primary: primary.clone(),
                backup: backup.clone(),
                trigger,
                started_at: now,
            },
        );
        warn!(cluster_id = %primary, backup = %backup, %trigger, "Failover started");

        if self.orchestrator.cluster_status(primary) == Some(ClusterStatus::Failed) {
            if let Err(e) = self.orchestrator.restart_cluster(primary).await {
                warn!(cluster_id = %primary, "Restart of failed primary did not succeed: {}", e);
            }
        }

        event.success = true;
        self.record_event(event.clone());
        self.orchestrator
            .publish_event(CoordinationEvent::FailoverStarted {
                cluster_id: primary.clone(),
                backup_cluster: backup,
                trigger,
                started_at: now,
            })
            .await;
        event
    }

    async fn fail_back(
        &self,
        primary: &ClusterId,
        trigger: FailoverTrigger,
        reason: String,
        now: DateTime<Utc>,
    ) -> Option<FailoverEvent> {
        let active = self.active.write().remove(primary)?;
        self.orchestrator.clear_redirect(primary);
        let duration = elapsed_since(active.started_at, now);
        info!(
            cluster_id = %primary,
            backup = %active.backup,
            duration_ms = duration.as_millis() as u64,
            "Failback completed"
        );

        let event = FailoverEvent {
            id: Uuid::new_v4(),
            kind: FailoverKind::Failback,
            primary_cluster: primary.clone(),
            backup_cluster: Some(active.backup.clone()),
            trigger,
            reason,
            success: true,
            error: None,
            recovery_duration: Some(duration),
            timestamp: now,
        };
        self.record_event(event.clone());
        self.orchestrator
            .publish_event(CoordinationEvent::FailbackCompleted {
                cluster_id: primary.clone(),
                backup_cluster: active.backup,
                duration_ms: duration.as_millis() as u64,
                completed_at: now,
            })
            .await;
        Some(event)
    }

    fn record_event(&self, event: FailoverEvent) {
        let kind = match event.kind {
            FailoverKind::Failover => "failover",
            FailoverKind::Failback => "failback",
        };
        let outcome = if event.success { "success" } else { "failure" };
        metrics::counter!("cohort_failover_transitions_total", "kind" => kind, "outcome" => outcome).increment(1);

        let mut events = self.events.lock();
        events.push_back(event);
        while events.len() > self.config.max_history {
            events.pop_front();
        }
    }

    /// Recorded transitions, oldest first, optionally for one primary.
    pub fn events(&self, cluster_id: Option<&ClusterId>) -> Vec<FailoverEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| cluster_id.map_or(true, |id| &e.primary_cluster == id))
            .cloned()
            .collect()
    }

    /// Spawns the monitoring loop. Each start gets a fresh shutdown token.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let shutdown = CancellationToken::new();
        *self.shutdown_token.lock() = shutdown.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            if !manager.config.enabled {
                info!("FailoverManager disabled");
                return;
            }
            info!(interval = ?manager.config.check_interval, "Starting FailoverManager");
            let mut tick = interval(manager.config.check_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let events = manager.check_cycle(Utc::now()).await;
                        if !events.is_empty() {
                            debug!(transitions = events.len(), "Failover cycle completed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("FailoverManager shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown_token.lock().cancel();
    }
}

fn describe(trigger: FailoverTrigger, condition: &ClusterCondition) -> String {
    match trigger {
        FailoverTrigger::HealthThreshold => format!("health at {:.1}%", condition.health_percentage),
        FailoverTrigger::ResponseTime => format!("average latency {:.0} ms", condition.average_latency_ms),
        FailoverTrigger::ErrorRate => format!("error rate {:.1}%", condition.error_rate),
        FailoverTrigger::ClusterFailure => "cluster failed".to_string(),
        FailoverTrigger::Manual => "manual".to_string(),
    }
}
