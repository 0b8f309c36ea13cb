// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Request/response transport.
//
// Server side is an axum router:
//   POST /messages  -> {"status": "received", "message_id": ...}
//   GET  /health    -> {"status": "healthy", "protocol": "http"}
//   GET  /metrics   -> broker metrics snapshot
// Client side posts the message wire shape with reqwest.

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::domain::message::Message;
use crate::infrastructure::broker::BrokerHandle;
use crate::infrastructure::message_queue::QueueError;
use crate::infrastructure::transport::{Protocol, TransportError, TransportHandler};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Server {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HttpTransport {
    handle: BrokerHandle,
    client: reqwest::Client,
    server: Mutex<Option<Server>>,
}

impl HttpTransport {
    pub fn new(handle: BrokerHandle) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            handle,
            client,
            server: Mutex::new(None),
        }
    }
}

/// Router serving inbound messages for `handle`.
pub fn router(handle: BrokerHandle) -> Router {
    Router::new()
        .route("/messages", post(receive_message))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(handle)
        .layer(TraceLayer::new_for_http())
}

async fn receive_message(
    State(handle): State<BrokerHandle>,
    Json(message): Json<Message>,
) -> impl IntoResponse {
    let message_id = message.id;
    match handle.receive_message(message) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "received", "message_id": message_id })),
        ),
        Err(e @ QueueError::Full { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "rejected", "message_id": message_id, "error": e.to_string() })),
        ),
        Err(e @ QueueError::Expired(_)) => (
            StatusCode::GONE,
            Json(json!({ "status": "expired", "message_id": message_id, "error": e.to_string() })),
        ),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "protocol": Protocol::Http }))
}

async fn metrics(State(handle): State<BrokerHandle>) -> impl IntoResponse {
    Json(handle.metrics())
}

fn messages_url(target: &str) -> String {
    let base = if target.starts_with("http://") || target.starts_with("https://") {
        target.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", target.trim_end_matches('/'))
    };
    format!("{base}/messages")
}

#[async_trait]
impl TransportHandler for HttpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn start(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        if self.server.lock().is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| TransportError::Bind {
                address: format!("{host}:{port}"),
                source,
            })?;
        let address = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let app = router(self.handle.clone());
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!("HTTP transport server error: {}", e);
            }
        });

        let mut server = self.server.lock();
        if server.is_some() {
            shutdown.cancel();
            return Err(TransportError::AlreadyStarted);
        }
        *server = Some(Server { shutdown, task });
        info!(%address, "HTTP transport started");
        Ok(address)
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown.cancel();
            if let Err(e) = server.task.await {
                error!("HTTP transport task failed: {}", e);
            }
            info!("HTTP transport stopped");
        }
        Ok(())
    }

    async fn send(&self, message: &Message, target: &str) -> Result<(), TransportError> {
        let url = messages_url(target);
        debug!(message_id = %message.id, %url, "Sending message over HTTP");
        let response = self.client.post(&url).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
