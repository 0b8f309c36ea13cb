// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod autoscaler;
pub mod failover;
pub mod orchestrator;
pub mod registry;
pub mod status;

// Re-export services for convenience
pub use autoscaler::AutoScaler;
pub use failover::{FailoverError, FailoverManager};
pub use orchestrator::{
    AcknowledgeExecutor, ClusterLifecycleHook, ClusterLoad, Orchestrator, SendError, SendOutcome, TaskExecutor,
};
pub use registry::{ClusterRegistry, RegistryError};
pub use status::{ClusterState, StatusSnapshot};
