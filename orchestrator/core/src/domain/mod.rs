// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer (`cohort-core`)
//!
//! Pure types and state machines. Nothing here performs I/O; time is passed
//! in explicitly where behaviour depends on it.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`cluster`] | `Cluster`, `AgentSlot`, cluster kind catalog |
//! | [`circuit_breaker`] | Closed / open / half-open breaker |
//! | [`stats`] | Per-cluster load-balancing stats, global metrics |
//! | [`routing`] | Pattern-based routing rules |
//! | [`message`] | Message wire shape, subscriptions |
//! | [`registry`] | Registrations, endpoints, persisted snapshot |
//! | [`scaling`] | Scaling policies, samples, stress score, events |
//! | [`failover`] | Failover policies, triggers, events |
//! | [`events`] | Coordination events published over the broker |
//! | [`config`] | Validated configuration sections |

pub mod circuit_breaker;
pub mod cluster;
pub mod config;
pub mod events;
pub mod failover;
pub mod message;
pub mod registry;
pub mod routing;
pub mod scaling;
pub mod stats;
