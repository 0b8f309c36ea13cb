// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # AutoScaler
//!
//! Closed-loop sizing of clusters against their [`ScalingPolicy`].
//!
//! Each analysis cycle samples load from the [`Orchestrator`] (when
//! `collect_metrics` is set), averages the samples inside the policy's
//! metrics window, computes the stress score and decides:
//!
//! | Stress | Slot count | Action |
//! |--------|------------|--------|
//! | `>= scale_up_threshold` | `< max_agents` | add 1 slot (2 if aggressive) |
//! | `<= scale_down_threshold` | `> min_agents` | remove 1 idle slot |
//! | otherwise | | nothing, not recorded |
//!
//! Cool-downs are measured from the last action applied to the cluster. A
//! decision suppressed by its cool-down is recorded as a `stable` event.
//!
//! ## Load proxies
//!
//! The Orchestrator does not see host resources, so a sample maps
//! `cpu_usage` to the task-budget utilisation, `memory_usage` to pool fill
//! (`agent_count / max_agents`), and takes latency and error rate from the
//! cluster's load-balancing stats.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::orchestrator::{ClusterLoad, Orchestrator};
use crate::domain::cluster::{elapsed_since, AgentSlot, ClusterId, ClusterKind};
use crate::domain::config::{AutoScalerConfig, ConfigError};
use crate::domain::events::CoordinationEvent;
use crate::domain::scaling::{stress_score, ScalingDirection, ScalingEvent, ScalingMetrics, ScalingPolicy};

const MAX_SAMPLES_PER_CLUSTER: usize = 1000;

pub struct AutoScaler {
    config: AutoScalerConfig,
    orchestrator: Arc<Orchestrator>,
    policies: RwLock<HashMap<ClusterId, ScalingPolicy>>,
    samples: RwLock<HashMap<ClusterId, VecDeque<ScalingMetrics>>>,
    last_action: Mutex<HashMap<ClusterId, DateTime<Utc>>>,
    events: Mutex<VecDeque<ScalingEvent>>,
    shutdown_token: Mutex<CancellationToken>,
}

impl AutoScaler {
    pub fn new(config: AutoScalerConfig, orchestrator: Arc<Orchestrator>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            orchestrator,
            policies: RwLock::new(HashMap::new()),
            samples: RwLock::new(HashMap::new()),
            last_action: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            shutdown_token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn set_scaling_policy(&self, policy: ScalingPolicy) -> Result<(), ConfigError> {
        policy.validate()?;
        info!(
            cluster_id = %policy.cluster_id,
            min = policy.min_agents,
            max = policy.max_agents,
            "Scaling policy set"
        );
        self.policies.write().insert(policy.cluster_id.clone(), policy);
        Ok(())
    }

    pub fn remove_scaling_policy(&self, cluster_id: &ClusterId) -> Option<ScalingPolicy> {
        self.samples.write().remove(cluster_id);
        self.policies.write().remove(cluster_id)
    }

    pub fn scaling_policy(&self, cluster_id: &ClusterId) -> Option<ScalingPolicy> {
        self.policies.read().get(cluster_id).cloned()
    }

    pub fn record_metrics(&self, cluster_id: &ClusterId, sample: ScalingMetrics) {
        let mut samples = self.samples.write();
        let history = samples.entry(cluster_id.clone()).or_default();
        history.push_back(sample);
        while history.len() > MAX_SAMPLES_PER_CLUSTER {
            history.pop_front();
        }
    }

    /// Samples every cluster that has a policy. Returns the number sampled.
    pub fn collect(&self, now: DateTime<Utc>) -> usize {
        let ids: Vec<ClusterId> = self.policies.read().keys().cloned().collect();
        let mut collected = 0;
        for id in ids {
            if let Some(load) = self.orchestrator.cluster_load(&id) {
                self.record_metrics(&id, sample_from_load(&load, now));
                collected += 1;
            }
        }
        collected
    }

    /// Runs one decision for `cluster_id`. Returns the recorded event, if
    /// the decision produced one.
    pub async fn evaluate_cluster(&self, cluster_id: &ClusterId, now: DateTime<Utc>) -> Option<ScalingEvent> {
        let policy = self.policies.read().get(cluster_id).cloned()?;
        if !policy.enabled {
            return None;
        }
        let Some(average) = self.windowed_average(cluster_id, policy.metrics_window, now) else {
            debug!(cluster_id = %cluster_id, "No recent metrics, skipping scaling analysis");
            return None;
        };
        let Some(cluster) = self.orchestrator.cluster(cluster_id) else {
            debug!(cluster_id = %cluster_id, "Scaling policy refers to an unknown cluster");
            return None;
        };
        let current = cluster.agent_count();
        let stress = stress_score(&average, policy.target_response_time_ms);

        let (direction, cooldown) = if stress >= policy.scale_up_threshold && current < policy.max_agents {
            (ScalingDirection::Up, policy.scale_up_cooldown)
        } else if stress <= policy.scale_down_threshold && current > policy.min_agents {
            (ScalingDirection::Down, policy.scale_down_cooldown)
        } else {
            return None;
        };

        if let Some(remaining) = self.cooldown_remaining(cluster_id, cooldown, now) {
            let reason = format!(
                "scale {} suppressed by cool-down ({}s remaining)",
                if direction == ScalingDirection::Up { "up" } else { "down" },
                remaining.as_secs()
            );
            debug!(cluster_id = %cluster_id, stress, "{}", reason);
            let event = ScalingEvent {
                id: Uuid::new_v4(),
                cluster_id: cluster_id.clone(),
                direction: ScalingDirection::Stable,
                reason,
                agents_before: current,
                agents_after: current,
                stress_score: stress,
                metrics: average,
                success: true,
                error: None,
                timestamp: now,
            };
            self.record_event(event.clone()).await;
            return Some(event);
        }

        let event = match direction {
            ScalingDirection::Up => self.scale_up(&policy, current, stress, average, now).await,
            _ => self.scale_down(&policy, current, stress, average, now).await,
        };
        self.record_event(event.clone()).await;
        Some(event)
    }

    /// One full analysis cycle over every policy.
    pub async fn analyze(&self, now: DateTime<Utc>) -> Vec<ScalingEvent> {
        if self.config.collect_metrics {
            self.collect(now);
        }
        let ids: Vec<ClusterId> = self.policies.read().keys().cloned().collect();
        let mut events = Vec::new();
        for id in ids {
            if let Some(event) = self.evaluate_cluster(&id, now).await {
                events.push(event);
            }
        }
        events
    }

    fn windowed_average(&self, cluster_id: &ClusterId, window: Duration, now: DateTime<Utc>) -> Option<ScalingMetrics> {
        let samples = self.samples.read();
        let recent: Vec<&ScalingMetrics> = samples
            .get(cluster_id)?
            .iter()
            .filter(|m| m.timestamp <= now && elapsed_since(m.timestamp, now) <= window)
            .collect();
        ScalingMetrics::average(&recent)
    }

    fn cooldown_remaining(&self, cluster_id: &ClusterId, cooldown: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let last = *self.last_action.lock().get(cluster_id)?;
        let since = elapsed_since(last, now);
        (since < cooldown).then(|| cooldown - since)
    }

    async fn scale_up(
        &self,
        policy: &ScalingPolicy,
        current: usize,
        stress: f64,
        metrics: ScalingMetrics,
        now: DateTime<Utc>,
    ) -> ScalingEvent {
        let cluster_id = &policy.cluster_id;
        let wanted = policy.scale_up_step().min(policy.max_agents - current);
        let profile = ClusterKind::from_name(cluster_id.as_str()).profile();

        let mut added = 0;
        let mut errors = Vec::new();
        for _ in 0..wanted {
            let suffix = Uuid::new_v4().simple().to_string();
            let slot = AgentSlot::new(
                format!("{}-auto-{}", cluster_id, &suffix[..8]),
                profile.capabilities.iter().copied(),
            )
            .with_role(profile.role);
            match self.orchestrator.register_agent(cluster_id, slot).await {
                Ok(()) => added += 1,
                Err(e) => {
                    warn!(cluster_id = %cluster_id, "Failed to add slot during scale-up: {}", e);
                    errors.push(e.to_string());
                }
            }
        }
        if added > 0 {
            self.last_action.lock().insert(cluster_id.clone(), now);
        }
        info!(cluster_id = %cluster_id, stress, added, requested = wanted, "Scaled up");

        ScalingEvent {
            id: Uuid::new_v4(),
            cluster_id: cluster_id.clone(),
            direction: ScalingDirection::Up,
            reason: format!("stress {:.1} >= {:.1}", stress, policy.scale_up_threshold),
            agents_before: current,
            agents_after: current + added,
            stress_score: stress,
            metrics,
            success: errors.is_empty(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            timestamp: now,
        }
    }

    async fn scale_down(
        &self,
        policy: &ScalingPolicy,
        current: usize,
        stress: f64,
        metrics: ScalingMetrics,
        now: DateTime<Utc>,
    ) -> ScalingEvent {
        let cluster_id = &policy.cluster_id;
        let mut event = ScalingEvent {
            id: Uuid::new_v4(),
            cluster_id: cluster_id.clone(),
            direction: ScalingDirection::Down,
            reason: format!("stress {:.1} <= {:.1}", stress, policy.scale_down_threshold),
            agents_before: current,
            agents_after: current,
            stress_score: stress,
            metrics,
            success: false,
            error: None,
            timestamp: now,
        };

        let victim = self.orchestrator.cluster(cluster_id).and_then(|cluster| {
            cluster
                .agents()
                .filter(|slot| slot.current_tasks == 0)
                .min_by(|a, b| a.load().total_cmp(&b.load()).then(a.health.total_cmp(&b.health)))
                .map(|slot| slot.id.clone())
        });
        let Some(victim) = victim else {
            debug!(cluster_id = %cluster_id, "No idle slot to remove");
            event.error = Some("no idle slot available for removal".into());
            return event;
        };

        match self.orchestrator.unregister_agent(cluster_id, &victim).await {
            Ok(_) => {
                self.last_action.lock().insert(cluster_id.clone(), now);
                info!(cluster_id = %cluster_id, agent_id = %victim, stress, "Scaled down");
                event.agents_after = current - 1;
                event.success = true;
            }
            Err(e) => {
                warn!(cluster_id = %cluster_id, agent_id = %victim, "Failed to remove slot: {}", e);
                event.error = Some(e.to_string());
            }
        }
        event
    }

    async fn record_event(&self, event: ScalingEvent) {
        {
            let mut events = self.events.lock();
            events.push_back(event.clone());
            while events.len() > self.config.max_history {
                events.pop_front();
            }
        }
        let direction = match event.direction {
            ScalingDirection::Up => "up",
            ScalingDirection::Down => "down",
            ScalingDirection::Stable => "stable",
        };
        metrics::counter!("cohort_scaling_decisions_total", "direction" => direction).increment(1);

        self.orchestrator
            .publish_event(CoordinationEvent::ScalingDecision {
                cluster_id: event.cluster_id,
                direction: event.direction,
                agents_before: event.agents_before,
                agents_after: event.agents_after,
                success: event.success,
                decided_at: event.timestamp,
            })
            .await;
    }

    /// Recorded decisions, oldest first, optionally for one cluster.
    pub fn events(&self, cluster_id: Option<&ClusterId>) -> Vec<ScalingEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| cluster_id.map_or(true, |id| &e.cluster_id == id))
            .cloned()
            .collect()
    }

    /// Spawns the monitoring loop. Each start gets a fresh shutdown token.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let shutdown = CancellationToken::new();
        *self.shutdown_token.lock() = shutdown.clone();
        let scaler = self.clone();
        tokio::spawn(async move {
            if !scaler.config.enabled {
                info!("AutoScaler disabled");
                return;
            }
            info!(interval = ?scaler.config.analysis_interval, "Starting AutoScaler");
            let mut tick = interval(scaler.config.analysis_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let events = scaler.analyze(Utc::now()).await;
                        if !events.is_empty() {
                            debug!(decisions = events.len(), "Scaling cycle completed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("AutoScaler shutting down");
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

fn sample_from_load(load: &ClusterLoad, now: DateTime<Utc>) -> ScalingMetrics {
    let pool_fill = if load.max_agents == 0 {
        0.0
    } else {
        load.agent_count as f64 / load.max_agents as f64 * 100.0
    };
    ScalingMetrics {
        cpu_usage: load.load_percentage,
        memory_usage: pool_fill,
        response_time_ms: load.average_latency_ms,
        error_rate: load.error_rate,
        load_percentage: load.load_percentage,
        active_agents: load.active_agents,
        available_agents: load.available_agents,
        timestamp: now,
    }
}
