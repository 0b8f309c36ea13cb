// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod broker;
pub mod discovery;
pub mod event_bus;
pub mod message_queue;
pub mod registry_store;
pub mod telemetry;
pub mod transport;

pub use broker::{BrokerHandle, DeliveryReport, MessageBroker};
pub use event_bus::{handler_fn, EventBus, MessageHandler};
pub use message_queue::MessageQueue;
