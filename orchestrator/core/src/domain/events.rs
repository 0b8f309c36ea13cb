// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::circuit_breaker::CircuitState;
use crate::domain::cluster::{ClusterId, ClusterStatus};
use crate::domain::failover::FailoverTrigger;
use crate::domain::scaling::ScalingDirection;

/// Cross-cluster notifications emitted by the coordination services.
///
/// Carried over the broker as `event`-kind messages whose payload is the
/// serialized variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinationEvent {
    ClusterRegistered {
        cluster_id: ClusterId,
        registered_at: DateTime<Utc>,
    },
    ClusterUnregistered {
        cluster_id: ClusterId,
        unregistered_at: DateTime<Utc>,
    },
    ClusterStatusChanged {
        cluster_id: ClusterId,
        from: ClusterStatus,
        to: ClusterStatus,
        changed_at: DateTime<Utc>,
    },
    ClusterRestarted {
        cluster_id: ClusterId,
        status: ClusterStatus,
        restarted_at: DateTime<Utc>,
    },
    BreakerStateChanged {
        cluster_id: ClusterId,
        state: CircuitState,
        changed_at: DateTime<Utc>,
    },
    ScalingDecision {
        cluster_id: ClusterId,
        direction: ScalingDirection,
        agents_before: usize,
        agents_after: usize,
        success: bool,
        decided_at: DateTime<Utc>,
    },
    FailoverStarted {
        cluster_id: ClusterId,
        backup_cluster: ClusterId,
        trigger: FailoverTrigger,
        started_at: DateTime<Utc>,
    },
    FailbackCompleted {
        cluster_id: ClusterId,
        backup_cluster: ClusterId,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    RegistrationExpired {
        cluster_id: ClusterId,
        expired_at: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Dotted topic name; subscriptions can match it as a pattern.
    pub fn topic(&self) -> &'static str {
        match self {
            CoordinationEvent::ClusterRegistered { .. } => "cluster.registered",
            CoordinationEvent::ClusterUnregistered { .. } => "cluster.unregistered",
            CoordinationEvent::ClusterStatusChanged { .. } => "cluster.status_changed",
            CoordinationEvent::ClusterRestarted { .. } => "cluster.restarted",
            CoordinationEvent::BreakerStateChanged { .. } => "breaker.state_changed",
            CoordinationEvent::ScalingDecision { .. } => "scaling.decision",
            CoordinationEvent::FailoverStarted { .. } => "failover.started",
            CoordinationEvent::FailbackCompleted { .. } => "failover.failback",
            CoordinationEvent::RegistrationExpired { .. } => "registry.expired",
        }
    }

    pub fn cluster_id(&self) -> &ClusterId {
        match self {
            CoordinationEvent::ClusterRegistered { cluster_id, .. }
            | CoordinationEvent::ClusterUnregistered { cluster_id, .. }
            | CoordinationEvent::ClusterStatusChanged { cluster_id, .. }
            | CoordinationEvent::ClusterRestarted { cluster_id, .. }
            | CoordinationEvent::BreakerStateChanged { cluster_id, .. }
            | CoordinationEvent::ScalingDecision { cluster_id, .. }
            | CoordinationEvent::FailoverStarted { cluster_id, .. }
            | CoordinationEvent::FailbackCompleted { cluster_id, .. }
            | CoordinationEvent::RegistrationExpired { cluster_id, .. } => cluster_id,
        }
    }
}
