// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Scaling Domain
//!
//! Policies, metric samples and decision records for the AutoScaler.
//!
//! ## Stress Score
//!
//! | Signal | Weight |
//! |--------|--------|
//! | cpu % | 0.25 |
//! | memory % | 0.20 |
//! | normalized response time | 0.25 |
//! | load % | 0.25 |
//! | error rate % | 0.05 |
//!
//! Normalized response time is `min(100, observed_ms / target_ms × 100)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::cluster::ClusterId;
use crate::domain::config::ConfigError;

const CPU_WEIGHT: f64 = 0.25;
const MEMORY_WEIGHT: f64 = 0.20;
const RESPONSE_TIME_WEIGHT: f64 = 0.25;
const LOAD_WEIGHT: f64 = 0.25;
const ERROR_RATE_WEIGHT: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub cluster_id: ClusterId,
    pub min_agents: usize,
    pub max_agents: usize,
    pub target_utilization: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "humantime_serde")]
    pub scale_down_cooldown: Duration,
    /// Samples older than this are ignored when averaging.
    #[serde(with = "humantime_serde")]
    pub metrics_window: Duration,
    pub target_response_time_ms: f64,
    pub aggressive_scaling: bool,
    pub enabled: bool,
}

impl ScalingPolicy {
    pub fn new(cluster_id: impl Into<String>, min_agents: usize, max_agents: usize) -> Self {
        Self {
            cluster_id: ClusterId::new(cluster_id),
            min_agents,
            max_agents,
            target_utilization: 70.0,
            scale_up_threshold: 80.0,
            scale_down_threshold: 30.0,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            metrics_window: Duration::from_secs(300),
            target_response_time_ms: 1000.0,
            aggressive_scaling: false,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid { field, reason };
        if self.min_agents > self.max_agents {
            return Err(invalid(
                "scaling_policy.min_agents",
                format!("min {} exceeds max {}", self.min_agents, self.max_agents),
            ));
        }
        if self.max_agents == 0 {
            return Err(invalid("scaling_policy.max_agents", "must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.scale_up_threshold)
            || !(0.0..=100.0).contains(&self.scale_down_threshold)
        {
            return Err(invalid("scaling_policy.thresholds", "must lie within 0..=100".into()));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(invalid(
                "scaling_policy.thresholds",
                "scale-down threshold must be below scale-up threshold".into(),
            ));
        }
        if self.target_response_time_ms <= 0.0 {
            return Err(invalid("scaling_policy.target_response_time_ms", "must be positive".into()));
        }
        Ok(())
    }

    /// Slots added by one scale-up decision.
    pub fn scale_up_step(&self) -> usize {
        if self.aggressive_scaling {
            2
        } else {
            1
        }
    }
}

/// One timestamped load sample for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub response_time_ms: f64,
    /// Percentage, `0..=100`.
    pub error_rate: f64,
    pub load_percentage: f64,
    pub active_agents: usize,
    pub available_agents: usize,
    pub timestamp: DateTime<Utc>,
}

impl ScalingMetrics {
    /// Mean of the samples; `None` for an empty slice. Slot counts come from
    /// the newest sample.
    pub fn average(samples: &[&ScalingMetrics]) -> Option<ScalingMetrics> {
        let latest = samples.iter().max_by_key(|m| m.timestamp)?;
        let n = samples.len() as f64;
        let mean = |f: fn(&ScalingMetrics) -> f64| samples.iter().map(|m| f(m)).sum::<f64>() / n;
        Some(ScalingMetrics {
            cpu_usage: mean(|m| m.cpu_usage),
            memory_usage: mean(|m| m.memory_usage),
            response_time_ms: mean(|m| m.response_time_ms),
            error_rate: mean(|m| m.error_rate),
            load_percentage: mean(|m| m.load_percentage),
            active_agents: latest.active_agents,
            available_agents: latest.available_agents,
            timestamp: latest.timestamp,
        })
    }
}

pub fn stress_score(metrics: &ScalingMetrics, target_response_time_ms: f64) -> f64 {
    let normalized_rt = if target_response_time_ms > 0.0 {
        (metrics.response_time_ms / target_response_time_ms * 100.0).min(100.0)
    } else {
        100.0
    };
    metrics.cpu_usage * CPU_WEIGHT
        + metrics.memory_usage * MEMORY_WEIGHT
        + normalized_rt * RESPONSE_TIME_WEIGHT
        + metrics.load_percentage * LOAD_WEIGHT
        + metrics.error_rate * ERROR_RATE_WEIGHT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
    Stable,
}

/// Immutable record of one scaling decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: Uuid,
    pub cluster_id: ClusterId,
    pub direction: ScalingDirection,
    pub reason: String,
    pub agents_before: usize,
    pub agents_after: usize,
    pub stress_score: f64,
    pub metrics: ScalingMetrics,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, mem: f64, rt: f64, load: f64, err: f64) -> ScalingMetrics {
        ScalingMetrics {
            cpu_usage: cpu,
            memory_usage: mem,
            response_time_ms: rt,
            error_rate: err,
            load_percentage: load,
            active_agents: 2,
            available_agents: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_stress_score_weights() {
        let m = sample(100.0, 100.0, 1000.0, 100.0, 100.0);
        assert!((stress_score(&m, 1000.0) - 100.0).abs() < 1e-9);

        let m = sample(40.0, 50.0, 500.0, 60.0, 10.0);
        // 10 + 10 + 12.5 + 15 + 0.5
        assert!((stress_score(&m, 1000.0) - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_response_time_normalization_is_capped() {
        let m = sample(0.0, 0.0, 10_000.0, 0.0, 0.0);
        assert!((stress_score(&m, 1000.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ScalingPolicy::new("c", 1, 5).validate().is_ok());
        assert!(ScalingPolicy::new("c", 6, 5).validate().is_err());

        let mut policy = ScalingPolicy::new("c", 1, 5);
        policy.scale_down_threshold = 90.0;
        assert!(matches!(policy.validate(), Err(ConfigError::Invalid { field: "scaling_policy.thresholds", .. })));
    }

    #[test]
    fn test_average_uses_latest_counts() {
        let a = sample(20.0, 0.0, 0.0, 0.0, 0.0);
        let mut b = sample(40.0, 0.0, 0.0, 0.0, 0.0);
        b.timestamp = a.timestamp + chrono::Duration::seconds(1);
        b.active_agents = 7;
        let avg = ScalingMetrics::average(&[&a, &b]).unwrap();
        assert_eq!(avg.cpu_usage, 30.0);
        assert_eq!(avg.active_agents, 7);
        assert!(ScalingMetrics::average(&[]).is_none());
    }
}
