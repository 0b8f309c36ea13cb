// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transports
//!
//! Pluggable per-protocol message carriers used by the broker.
//!
//! | Module | Style | Framing |
//! |--------|-------|---------|
//! | [`http`] | request / response | `POST /messages` with a JSON body |
//! | [`tcp`] | persistent connection | length-delimited JSON frames |
//!
//! Inbound messages are handed to [`BrokerHandle::receive_message`], which
//! enqueues them for local delivery.
//!
//! [`BrokerHandle::receive_message`]: crate::infrastructure::broker::BrokerHandle::receive_message

pub mod http;
pub mod tcp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::domain::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// In-process delivery through the event bus.
    Internal,
    Http,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Internal => "internal",
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport is already started")]
    AlreadyStarted,

    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Peer rejected message with status {status}")]
    Rejected { status: u16 },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait TransportHandler: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Starts listening and returns the bound address (port `0` picks a free
    /// port).
    async fn start(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    /// Delivers one message to `target` (`host:port` or a URL for HTTP).
    async fn send(&self, message: &Message, target: &str) -> Result<(), TransportError>;
}
