// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Load-balancing statistics and global orchestrator metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-cluster request counters consumed by routing, the breaker and the
/// AutoScaler's stress score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls refused by an open breaker. Not counted as requests.
    pub rejected: u64,
    pub average_latency_ms: f64,
    pub last_request: Option<DateTime<Utc>>,
}

impl LoadBalancingStats {
    pub fn record(&mut self, success: bool, latency_ms: f64, now: DateTime<Utc>) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / self.requests as f64;
        self.last_request = Some(now);
    }

    pub fn record_rejection(&mut self) {
        self.rejected += 1;
    }

    /// Starts a new sample for the error rate and latency average. Rejection
    /// count and the last request time carry over.
    pub fn restart_window(&mut self) {
        *self = Self {
            rejected: self.rejected,
            last_request: self.last_request,
            ..Self::default()
        };
    }

    /// Failed share of executed requests, in percent.
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.failures as f64 / self.requests as f64 * 100.0
    }
}

/// Process-wide counters across every cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub breaker_rejections: u64,
    pub routing_failures: u64,
    pub average_latency_ms: f64,
}

impl OrchestratorMetrics {
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.average_latency_ms +=
            (latency_ms - self.average_latency_ms) / self.total_requests as f64;
    }
}
