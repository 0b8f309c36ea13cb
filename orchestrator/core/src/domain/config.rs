// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Coordination configuration.
//
// Consumed as an already-validated structure by every component. Each
// section can be deserialized on its own; `CohortConfig` aggregates them for
// YAML files. Durations use humantime strings ("30s", "5m").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::domain::cluster::ClusterId;
use crate::domain::registry::ServiceKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub autoscaler: AutoScalerConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub broker: BrokerConfig,
}

impl CohortConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CohortConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.registry.validate()?;
        self.autoscaler.validate()?;
        self.failover.validate()?;
        self.broker.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time since the last failure before an open breaker admits a probe call.
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Calls admitted while half-open; that many successes close the breaker.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Restart clusters observed in `failed` status during health checks.
    #[serde(default = "default_true")]
    pub auto_recovery: bool,

    /// Slot heartbeat window used for staleness decay.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub agent_heartbeat_window: Duration,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            auto_recovery: true,
            agent_heartbeat_window: default_heartbeat_interval(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval.is_zero() {
            return Err(invalid("orchestrator.health_check_interval", "must be non-zero"));
        }
        self.circuit_breaker.validate()
    }
}

/// Inclusive port range scanned by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Registrations older than `max_missed_heartbeats × heartbeat_interval`
    /// are purged by the cleanup pass.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,

    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    #[serde(default = "default_scan_hosts")]
    pub scan_hosts: Vec<String>,

    #[serde(default)]
    pub scan_ports: Vec<PortRange>,

    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,

    /// Responses faster than this raise an endpoint's health score quickly.
    #[serde(default = "default_fast_response", with = "humantime_serde")]
    pub fast_response_threshold: Duration,

    /// Where membership is persisted on stop and restored on start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_path: Option<PathBuf>,

    /// Static association of detected service kinds to clusters.
    #[serde(default)]
    pub service_clusters: HashMap<ServiceKind, ClusterId>,

    #[serde(default)]
    pub endpoint_breaker: CircuitBreakerConfig,

    /// Unreachable or offline endpoints not seen for this long are forgotten.
    #[serde(default = "default_endpoint_eviction_age", with = "humantime_serde")]
    pub endpoint_eviction_age: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            discovery_interval: default_discovery_interval(),
            health_check_interval: default_health_check_interval(),
            scan_hosts: default_scan_hosts(),
            scan_ports: Vec::new(),
            probe_timeout: default_probe_timeout(),
            max_concurrent_probes: default_max_concurrent_probes(),
            fast_response_threshold: default_fast_response(),
            persistence_path: None,
            service_clusters: HashMap::new(),
            endpoint_breaker: CircuitBreakerConfig::default(),
            endpoint_eviction_age: default_endpoint_eviction_age(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("registry.heartbeat_interval", "must be non-zero"));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(invalid("registry.max_missed_heartbeats", "must be at least 1"));
        }
        if self.max_concurrent_probes == 0 {
            return Err(invalid("registry.max_concurrent_probes", "must be at least 1"));
        }
        if self.discovery_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(invalid("registry.intervals", "loop intervals must be non-zero"));
        }
        if self.endpoint_eviction_age.is_zero() {
            return Err(invalid("registry.endpoint_eviction_age", "must be non-zero"));
        }
        if let Some(range) = self.scan_ports.iter().find(|r| r.start > r.end) {
            return Err(invalid(
                "registry.scan_ports",
                format!("range {}-{} is reversed", range.start, range.end),
            ));
        }
        self.endpoint_breaker.validate()
    }

    /// Age after which a registration is considered expired.
    pub fn expiry_age(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScalerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_analysis_interval", with = "humantime_serde")]
    pub analysis_interval: Duration,

    /// Sample load from the Orchestrator on every analysis cycle.
    #[serde(default = "default_true")]
    pub collect_metrics: bool,

    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            analysis_interval: default_analysis_interval(),
            collect_metrics: true,
            max_history: default_max_history(),
        }
    }
}

impl AutoScalerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis_interval.is_zero() {
            return Err(invalid("autoscaler.analysis_interval", "must be non-zero"));
        }
        if self.max_history == 0 {
            return Err(invalid("autoscaler.max_history", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_failover_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_failover_check_interval(),
            max_history: default_max_history(),
        }
    }
}

impl FailoverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(invalid("failover.check_interval", "must be non-zero"));
        }
        if self.max_history == 0 {
            return Err(invalid("failover.max_history", "must be at least 1"));
        }
        Ok(())
    }
}

/// Address a transport listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportBinding {
    #[serde(default = "default_bind_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Maximum number of messages across all priority lanes.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    #[serde(default = "default_event_tap_capacity")]
    pub event_tap_capacity: usize,

    /// Request/response transport listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<TransportBinding>,

    /// Persistent-connection transport listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TransportBinding>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            history_size: default_history_size(),
            dead_letter_capacity: default_dead_letter_capacity(),
            retry_interval: default_retry_interval(),
            event_tap_capacity: default_event_tap_capacity(),
            http: None,
            tcp: None,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(invalid("broker.max_queue_size", "must be at least 1"));
        }
        if self.event_tap_capacity == 0 {
            return Err(invalid("broker.event_tap_capacity", "must be at least 1"));
        }
        if self.retry_interval.is_zero() {
            return Err(invalid("broker.retry_interval", "must be non-zero"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scan_hosts() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_max_concurrent_probes() -> usize {
    50
}

fn default_fast_response() -> Duration {
    Duration::from_millis(200)
}

fn default_endpoint_eviction_age() -> Duration {
    Duration::from_secs(600)
}

fn default_analysis_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_failover_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_history() -> usize {
    1000
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_history_size() -> usize {
    1000
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_event_tap_capacity() -> usize {
    1000
}
