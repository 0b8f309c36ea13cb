// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Read-only status snapshot for dashboards and external monitors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::application::orchestrator::Orchestrator;
use crate::domain::circuit_breaker::CircuitBreakerSnapshot;
use crate::domain::cluster::{
    AgentSlot, Cluster, ClusterId, ClusterKind, ClusterMetrics, ClusterStatus, LoadBalancingStrategy,
};
use crate::domain::routing::RoutingRule;
use crate::domain::stats::{LoadBalancingStats, OrchestratorMetrics};

/// Serialized state of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterState {
    pub id: ClusterId,
    pub name: String,
    pub description: String,
    pub kind: ClusterKind,
    pub status: ClusterStatus,
    pub strategy: LoadBalancingStrategy,
    pub max_agents: usize,
    pub health_percentage: f64,
    pub current_tasks: u32,
    pub agents: Vec<AgentSlot>,
    pub metrics: ClusterMetrics,
}

impl From<&Cluster> for ClusterState {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id.clone(),
            name: cluster.name.clone(),
            description: cluster.description.clone(),
            kind: cluster.kind,
            status: cluster.status,
            strategy: cluster.strategy,
            max_agents: cluster.max_agents,
            health_percentage: cluster.health_percentage(),
            current_tasks: cluster.total_tasks(),
            agents: cluster.agents().cloned().collect(),
            metrics: cluster.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
    pub clusters: BTreeMap<ClusterId, ClusterState>,
    pub breakers: BTreeMap<ClusterId, CircuitBreakerSnapshot>,
    pub stats: BTreeMap<ClusterId, LoadBalancingStats>,
    pub routing_rules: Vec<RoutingRule>,
    /// Primaries in failover and the backup receiving their traffic.
    pub redirects: BTreeMap<ClusterId, ClusterId>,
    pub metrics: OrchestratorMetrics,
}

impl StatusSnapshot {
    pub fn capture(orchestrator: &Orchestrator) -> Self {
        Self {
            running: orchestrator.is_running(),
            started_at: orchestrator.started_at(),
            captured_at: Utc::now(),
            clusters: orchestrator
                .clusters()
                .iter()
                .map(|c| (c.id.clone(), ClusterState::from(c)))
                .collect(),
            breakers: orchestrator.breaker_snapshots(),
            stats: orchestrator.all_stats(),
            routing_rules: orchestrator.routing_rules(),
            redirects: orchestrator.redirects().into_iter().collect(),
            metrics: orchestrator.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::OrchestratorConfig;

    #[tokio::test]
    async fn test_snapshot_serializes_every_section() {
        let orch = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        orch.register_cluster(Cluster::new("core", "Core", ClusterKind::Core))
            .await
            .unwrap();
        orch.register_agent(&ClusterId::from("core"), AgentSlot::new("c1", ["execution"]))
            .await
            .unwrap();
        orch.add_routing_rule(RoutingRule::new("r", "urgent", "core", 0).unwrap())
            .unwrap();

        let snapshot = StatusSnapshot::capture(&orch);
        assert!(!snapshot.running);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["clusters"]["core"]["status"], "active");
        assert_eq!(json["clusters"]["core"]["agents"][0]["health"], 100.0);
        assert_eq!(json["breakers"]["core"]["state"], "closed");
        assert_eq!(json["stats"]["core"]["requests"], 0);
        assert_eq!(json["routing_rules"][0]["pattern"], "urgent");
        assert_eq!(json["metrics"]["total_requests"], 0);
    }
}
