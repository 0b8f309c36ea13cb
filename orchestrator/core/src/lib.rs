// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # cohort-core
//!
//! Cluster coordination and inter-cluster messaging: a registry of agent
//! clusters, a routing orchestrator with per-cluster circuit breakers, a
//! closed-loop autoscaler, a failover manager and a priority message broker.
//!
//! The services are constructed once per process and shared through `Arc`
//! handles; each owns its background loops and stops them through a
//! `CancellationToken`.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
