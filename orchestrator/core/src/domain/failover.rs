// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Failover policies, triggers and transition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::cluster::{ClusterId, ClusterStatus};
use crate::domain::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub cluster_id: ClusterId,
    /// Health percentage below which failover triggers.
    pub health_threshold: f64,
    pub max_response_time_ms: f64,
    /// Error-rate percentage above which failover triggers.
    pub max_error_rate: f64,
    /// Backups in preference order.
    pub backup_clusters: Vec<ClusterId>,
    pub auto_failback: bool,
    pub failback_health_threshold: f64,
    pub enabled: bool,
}

impl FailoverPolicy {
    pub fn new(cluster_id: impl Into<String>, backups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cluster_id: ClusterId::new(cluster_id),
            health_threshold: 50.0,
            max_response_time_ms: 5000.0,
            max_error_rate: 10.0,
            backup_clusters: backups.into_iter().map(ClusterId::new).collect(),
            auto_failback: true,
            failback_health_threshold: 80.0,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.backup_clusters.is_empty() {
            return Err(invalid("failover_policy.backup_clusters", "at least one backup is required"));
        }
        if self.backup_clusters.contains(&self.cluster_id) {
            return Err(invalid("failover_policy.backup_clusters", "a cluster cannot back itself up"));
        }
        if !(0.0..=100.0).contains(&self.health_threshold)
            || !(0.0..=100.0).contains(&self.failback_health_threshold)
        {
            return Err(invalid("failover_policy.health_threshold", "must lie within 0..=100"));
        }
        if self.failback_health_threshold < self.health_threshold {
            return Err(invalid(
                "failover_policy.failback_health_threshold",
                "must not be below the failover health threshold",
            ));
        }
        if self.max_response_time_ms <= 0.0 || self.max_error_rate < 0.0 {
            return Err(invalid("failover_policy.limits", "latency and error limits must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverTrigger {
    HealthThreshold,
    ResponseTime,
    ErrorRate,
    ClusterFailure,
    Manual,
}

impl fmt::Display for FailoverTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverTrigger::HealthThreshold => "health_threshold",
            FailoverTrigger::ResponseTime => "response_time",
            FailoverTrigger::ErrorRate => "error_rate",
            FailoverTrigger::ClusterFailure => "cluster_failure",
            FailoverTrigger::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Observed condition of a primary cluster at check time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterCondition {
    pub status: ClusterStatus,
    pub health_percentage: f64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
}

/// First crossed threshold in evaluation order, if any.
pub fn evaluate_trigger(policy: &FailoverPolicy, condition: &ClusterCondition) -> Option<FailoverTrigger> {
    if condition.health_percentage < policy.health_threshold {
        Some(FailoverTrigger::HealthThreshold)
    } else if condition.average_latency_ms > policy.max_response_time_ms {
        Some(FailoverTrigger::ResponseTime)
    } else if condition.error_rate > policy.max_error_rate {
        Some(FailoverTrigger::ErrorRate)
    } else if condition.status == ClusterStatus::Failed {
        Some(FailoverTrigger::ClusterFailure)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverKind {
    Failover,
    Failback,
}

/// A failover currently redirecting traffic away from a primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFailover {
    pub primary: ClusterId,
    pub backup: ClusterId,
    pub trigger: FailoverTrigger,
    pub started_at: DateTime<Utc>,
}

/// Immutable record of one failover or failback transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub kind: FailoverKind,
    pub primary_cluster: ClusterId,
    pub backup_cluster: Option<ClusterId>,
    pub trigger: FailoverTrigger,
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
    /// Time spent in failover, set on failback.
    #[serde(default, with = "humantime_serde")]
    pub recovery_duration: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> ClusterCondition {
        ClusterCondition {
            status: ClusterStatus::Active,
            health_percentage: 100.0,
            average_latency_ms: 10.0,
            error_rate: 0.0,
        }
    }

    #[test]
    fn test_no_trigger_when_within_limits() {
        let policy = FailoverPolicy::new("a", ["b"]);
        assert_eq!(evaluate_trigger(&policy, &healthy()), None);
    }

    #[test]
    fn test_trigger_evaluation_order() {
        let policy = FailoverPolicy::new("a", ["b"]);
        let mut condition = ClusterCondition {
            status: ClusterStatus::Failed,
            health_percentage: 10.0,
            average_latency_ms: 9000.0,
            error_rate: 50.0,
        };
        assert_eq!(evaluate_trigger(&policy, &condition), Some(FailoverTrigger::HealthThreshold));
        condition.health_percentage = 90.0;
        assert_eq!(evaluate_trigger(&policy, &condition), Some(FailoverTrigger::ResponseTime));
        condition.average_latency_ms = 1.0;
        assert_eq!(evaluate_trigger(&policy, &condition), Some(FailoverTrigger::ErrorRate));
        condition.error_rate = 0.0;
        assert_eq!(evaluate_trigger(&policy, &condition), Some(FailoverTrigger::ClusterFailure));
    }

    #[test]
    fn test_policy_validation() {
        assert!(FailoverPolicy::new("a", ["b"]).validate().is_ok());
        assert!(FailoverPolicy::new("a", Vec::<String>::new()).validate().is_err());
        assert!(FailoverPolicy::new("a", ["a"]).validate().is_err());

        let mut policy = FailoverPolicy::new("a", ["b"]);
        policy.failback_health_threshold = 10.0;
        assert!(policy.validate().is_err());
    }
}
