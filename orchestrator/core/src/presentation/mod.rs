// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer
//!
//! HTTP surface that exposes application state to external monitors. No
//! business logic lives here; handlers only read from the
//! [`Orchestrator`](crate::application::Orchestrator).
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | `GET /status` snapshot and `GET /clusters/{id}` |

pub mod api;
