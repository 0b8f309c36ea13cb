// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Network Discovery
//!
//! Best-effort service discovery over configured host/port ranges.
//!
//! 1. TCP connect to every `(host, port)` with a per-probe timeout.
//! 2. For reachable ports, an HTTP `GET /` identifies the service.
//! 3. The endpoint is classified by response content, then by well-known
//!    port.
//!
//! Probes share one semaphore so a scan never has more than
//! `max_concurrent_probes` connections outstanding. Health checks go through
//! the same limiter.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::config::{PortRange, RegistryConfig};
use crate::domain::registry::{ServiceEndpoint, ServiceKind};

const BODY_SNIFF_LIMIT: usize = 4096;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe of {address} timed out")]
    Timeout { address: SocketAddr },

    #[error("Connection to {address} failed: {reason}")]
    Connect { address: SocketAddr, reason: String },

    #[error("HTTP probe failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint answered with status {status}")]
    Unhealthy { status: u16 },

    #[error("Probe limiter closed")]
    LimiterClosed,
}

#[async_trait]
pub trait ServiceProber: Send + Sync {
    /// Scans `hosts × ports` and returns every reachable endpoint.
    async fn discover(&self, hosts: &[String], ports: &[PortRange]) -> Vec<ServiceEndpoint>;

    /// Issues one lightweight request and returns its latency.
    async fn check(&self, endpoint: &ServiceEndpoint) -> Result<Duration, ProbeError>;
}

pub struct NetworkProber {
    client: reqwest::Client,
    probe_timeout: Duration,
    limiter: Arc<Semaphore>,
}

impl NetworkProber {
    pub fn new(probe_timeout: Duration, max_concurrent_probes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            probe_timeout,
            limiter: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.probe_timeout, config.max_concurrent_probes)
    }

    async fn connect(&self, address: SocketAddr) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(ProbeError::Connect {
                address,
                reason: e.to_string(),
            }),
            Err(_) => Err(ProbeError::Timeout { address }),
        }
    }

    async fn probe(&self, address: SocketAddr) -> Option<ServiceEndpoint> {
        let _permit = self.limiter.acquire().await.ok()?;
        if let Err(e) = self.connect(address).await {
            debug!(%address, "Port closed: {}", e);
            return None;
        }

        let (protocol, body) = match self.client.get(format!("http://{address}/")).send().await {
            Ok(response) => {
                let server = response
                    .headers()
                    .get(reqwest::header::SERVER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let mut sniff = read_prefix(response, BODY_SNIFF_LIMIT).await;
                sniff.push(' ');
                sniff.push_str(&server);
                ("http", Some(sniff))
            }
            Err(_) => ("tcp", None),
        };

        let kind = classify(address.port(), body.as_deref());
        debug!(%address, ?kind, protocol, "Service discovered");
        Some(ServiceEndpoint::discovered(address, protocol, kind, Utc::now()))
    }
}

/// Reads at most `limit` bytes of the body; the rest is never fetched.
async fn read_prefix(mut response: reqwest::Response, limit: usize) -> String {
    let mut prefix = Vec::with_capacity(limit);
    while prefix.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - prefix.len());
                prefix.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Probe response body cut short: {}", e);
                break;
            }
        }
    }
    String::from_utf8_lossy(&prefix).into_owned()
}

/// Classifies a reachable endpoint by response content, then by port.
pub fn classify(port: u16, body: Option<&str>) -> ServiceKind {
    if let Some(body) = body {
        let body = body.to_ascii_lowercase();
        let by_content = [
            ("neo4j", ServiceKind::GraphDatabase),
            ("redis", ServiceKind::Cache),
            ("# help", ServiceKind::Metrics),
            ("prometheus", ServiceKind::Metrics),
            ("rabbitmq", ServiceKind::MessageBroker),
            ("kafka", ServiceKind::MessageBroker),
            ("nats", ServiceKind::MessageBroker),
            ("cluster_id", ServiceKind::AgentCluster),
            ("websocket", ServiceKind::WebSocket),
            ("postgres", ServiceKind::Database),
        ];
        if let Some((_, kind)) = by_content.iter().find(|(needle, _)| body.contains(needle)) {
            return *kind;
        }
    }

    match port {
        7474 | 7687 => ServiceKind::GraphDatabase,
        6379 => ServiceKind::Cache,
        5432 | 3306 | 27017 => ServiceKind::Database,
        9090 | 9100 => ServiceKind::Metrics,
        5672 | 9092 | 4222 => ServiceKind::MessageBroker,
        _ if body.is_some() => ServiceKind::HttpApi,
        80 | 443 | 8000 | 8080 => ServiceKind::HttpApi,
        _ => ServiceKind::Unknown,
    }
}

async fn resolve(host: &str, port: u16) -> Vec<SocketAddr> {
    match tokio::net::lookup_host((host, port)).await {
        Ok(addresses) => addresses.take(1).collect(),
        Err(e) => {
            debug!(host, port, "Failed to resolve host: {}", e);
            Vec::new()
        }
    }
}

#[async_trait]
impl ServiceProber for NetworkProber {
    async fn discover(&self, hosts: &[String], ports: &[PortRange]) -> Vec<ServiceEndpoint> {
        let mut targets = Vec::new();
        for host in hosts {
            for range in ports {
                for port in range.ports() {
                    targets.extend(resolve(host, port).await);
                }
            }
        }
        join_all(targets.into_iter().map(|address| self.probe(address)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn check(&self, endpoint: &ServiceEndpoint) -> Result<Duration, ProbeError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ProbeError::LimiterClosed)?;

        if endpoint.protocol != "http" {
            return self.connect(endpoint.address).await;
        }

        let started = Instant::now();
        let response = self
            .client
            .get(format!("http://{}/health", endpoint.address))
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ProbeError::Unhealthy {
                status: status.as_u16(),
            });
        }
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_classify_by_content_before_port() {
        assert_eq!(classify(8080, Some("Neo4j Browser")), ServiceKind::GraphDatabase);
        assert_eq!(classify(6379, Some("# HELP go_gc")), ServiceKind::Metrics);
        assert_eq!(classify(8000, Some(r#"{"cluster_id":"core"}"#)), ServiceKind::AgentCluster);
    }

    #[test]
    fn test_classify_by_port() {
        assert_eq!(classify(6379, None), ServiceKind::Cache);
        assert_eq!(classify(5432, None), ServiceKind::Database);
        assert_eq!(classify(8080, None), ServiceKind::HttpApi);
        assert_eq!(classify(12345, None), ServiceKind::Unknown);
        assert_eq!(classify(12345, Some("<html></html>")), ServiceKind::HttpApi);
    }

    #[tokio::test]
    async fn test_discover_finds_open_port_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        // accept and immediately drop connections
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let prober = NetworkProber::new(Duration::from_millis(200), 4);
        let found = prober
            .discover(&["127.0.0.1".to_string()], &[PortRange::single(open), PortRange::single(1)])
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address.port(), open);
        assert_eq!(found[0].protocol, "tcp");
    }

    #[tokio::test]
    async fn test_check_closed_port_fails() {
        let prober = NetworkProber::new(Duration::from_millis(200), 1);
        let endpoint = ServiceEndpoint::discovered(
            "127.0.0.1:1".parse().unwrap(),
            "tcp",
            ServiceKind::Unknown,
            Utc::now(),
        );
        assert!(prober.check(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_endless_body_is_sniffed_by_prefix() {
        use axum::body::Body;
        use bytes::Bytes;
        use futures::stream::{self, StreamExt};

        let endless = || {
            let head = stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"redis ready ")) });
            let filler = stream::repeat_with(|| Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; 1024])));
            Body::from_stream(head.chain(filler))
        };
        let app = axum::Router::new().route("/", axum::routing::get(move || async move { endless() }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let prober = NetworkProber::new(Duration::from_secs(2), 1);
        let found = prober
            .discover(&["127.0.0.1".to_string()], &[PortRange::single(port)])
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].protocol, "http");
        assert_eq!(found[0].kind, ServiceKind::Cache);
    }
}
