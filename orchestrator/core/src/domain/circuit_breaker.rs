// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Circuit Breaker
//!
//! Deterministic closed / open / half-open state machine shared by the
//! Orchestrator (one breaker per cluster) and the registry's endpoint health
//! checks (one breaker per endpoint).
//!
//! | State | Admission | Transition |
//! |-------|-----------|------------|
//! | `Closed` | every call | `failure_threshold` consecutive failures → `Open` |
//! | `Open` | none | `recovery_timeout` since last failure → `HalfOpen` |
//! | `HalfOpen` | up to `half_open_max_calls` | any failure → `Open`; budget of successes → `Closed` |
//!
//! Time is passed in explicitly so the machine stays pure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::cluster::elapsed_since;
use crate::domain::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when a call is refused by the breaker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit breaker is open (retry in {retry_after:?})")]
pub struct CircuitOpenError {
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    half_open_calls: u32,
    half_open_successes: u32,
    times_opened: u64,
}

/// Serializable view of a breaker for status snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub half_open_calls: u32,
    pub times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_calls: 0,
            half_open_successes: 0,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    /// Asks permission to make one call at `now`.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// before admission is decided.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), CircuitOpenError> {
        if self.state == CircuitState::Open {
            let since_failure = self
                .last_failure
                .map(|at| elapsed_since(at, now))
                .unwrap_or(self.config.recovery_timeout);
            if since_failure < self.config.recovery_timeout {
                return Err(CircuitOpenError {
                    retry_after: self.config.recovery_timeout - since_failure,
                });
            }
            self.enter_half_open();
        }

        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if self.half_open_calls < self.config.half_open_max_calls => {
                self.half_open_calls += 1;
                Ok(())
            }
            _ => Err(CircuitOpenError {
                retry_after: Duration::ZERO,
            }),
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_max_calls {
                    self.close();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_failure = Some(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.open();
            }
            CircuitState::HalfOpen => self.open(),
            _ => {}
        }
    }

    /// Returns a half-open admission that ended without an outcome.
    ///
    /// `generation` is [`Self::times_opened`] as seen at admission, so a
    /// permit taken before the breaker reopened cannot free a slot of the
    /// next half-open round.
    pub fn release(&mut self, generation: u64) {
        if self.state == CircuitState::HalfOpen && self.times_opened == generation {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    pub fn reset(&mut self) {
        self.close();
        self.last_failure = None;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure: self.last_failure,
            half_open_calls: self.half_open_calls,
            times_opened: self.times_opened,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        self.times_opened += 1;
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }
}
