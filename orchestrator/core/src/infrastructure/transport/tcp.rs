// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Persistent-connection transport.
//
// Frames are length-delimited JSON messages. The first valid frame on a
// connection names the peer: the `peer_id` header when present, otherwise an
// id is assigned from the source cluster and remote address. Frames that are
// not valid messages are dropped with a warning; the connection stays open.
//
// Outbound connections are pooled per target, each behind its own lock. A
// pooled connection whose peer has closed is replaced before use, and a
// failed write on a reused connection is retried once on a fresh one.
//
// Stopping the listener also ends every accepted connection.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::domain::message::Message;
use crate::infrastructure::broker::BrokerHandle;
use crate::infrastructure::transport::{Protocol, TransportError, TransportHandler};

pub const PEER_ID_HEADER: &str = "peer_id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Connection = Framed<TcpStream, LengthDelimitedCodec>;
type PooledConnection = Arc<tokio::sync::Mutex<Option<Connection>>>;

struct Server {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    connections: TaskTracker,
}

pub struct TcpTransport {
    handle: BrokerHandle,
    server: Mutex<Option<Server>>,
    peers: Arc<DashMap<String, SocketAddr>>,
    connections: DashMap<String, PooledConnection>,
}

impl TcpTransport {
    pub fn new(handle: BrokerHandle) -> Self {
        Self {
            handle,
            server: Mutex::new(None),
            peers: Arc::new(DashMap::new()),
            connections: DashMap::new(),
        }
    }

    fn pooled(&self, target: &str) -> PooledConnection {
        self.connections
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Peers currently connected to the listener, by peer id.
    pub fn peers(&self) -> Vec<(String, SocketAddr)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: BrokerHandle,
    peers: Arc<DashMap<String, SocketAddr>>,
    shutdown: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "TCP connection accepted");
                    connections.spawn(serve_connection(
                        stream,
                        remote,
                        handle.clone(),
                        peers.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!("TCP accept failed: {}", e),
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    handle: BrokerHandle,
    peers: Arc<DashMap<String, SocketAddr>>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let mut peer_id: Option<String> = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(%remote, "TCP read failed: {}", e);
                break;
            }
            None => break,
        };
        let message: Message = match serde_json::from_slice(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%remote, "Dropping invalid frame: {}", e);
                continue;
            }
        };
        if peer_id.is_none() {
            let id = message
                .headers
                .get(PEER_ID_HEADER)
                .cloned()
                .unwrap_or_else(|| format!("{}@{}", message.source_cluster, remote));
            info!(peer_id = %id, %remote, "TCP peer connected");
            peers.insert(id.clone(), remote);
            peer_id = Some(id);
        }
        if let Err(e) = handle.receive_message(message) {
            warn!(%remote, "Inbound TCP message rejected: {}", e);
        }
    }

    if let Some(id) = peer_id {
        peers.remove(&id);
        debug!(peer_id = %id, "TCP peer disconnected");
    }
}

async fn connect(target: &str) -> Result<Connection, TransportError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::Connect {
            target: target.to_string(),
            reason: "timed out".into(),
        })?
        .map_err(|e| TransportError::Connect {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, LengthDelimitedCodec::new()))
}

/// False once the peer has closed its end or the socket errored. Peers
/// never write on an outbound connection, so an inbound frame is discarded.
fn is_open(connection: &mut Connection) -> bool {
    match connection.next().now_or_never() {
        None | Some(Some(Ok(_))) => true,
        Some(None) | Some(Some(Err(_))) => false,
    }
}

#[async_trait]
impl TransportHandler for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
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
        let connections = TaskTracker::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.handle.clone(),
            self.peers.clone(),
            shutdown.clone(),
            connections.clone(),
        ));

        let mut server = self.server.lock();
        if server.is_some() {
            shutdown.cancel();
            return Err(TransportError::AlreadyStarted);
        }
        *server = Some(Server {
            shutdown,
            task,
            connections,
        });
        info!(%address, "TCP transport started");
        Ok(address)
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown.cancel();
            if let Err(e) = server.task.await {
                warn!("TCP accept task failed: {}", e);
            }
            server.connections.close();
            server.connections.wait().await;
            self.peers.clear();
            info!("TCP transport stopped");
        }
        self.connections.clear();
        Ok(())
    }

    async fn send(&self, message: &Message, target: &str) -> Result<(), TransportError> {
        let payload = Bytes::from(serde_json::to_vec(message)?);
        let pooled = self.pooled(target);
        let mut slot = pooled.lock().await;

        let pooled_before = slot.is_some();
        let reusable = slot
            .take()
            .and_then(|mut connection| is_open(&mut connection).then_some(connection));
        if pooled_before && reusable.is_none() {
            debug!(%target, "Pooled TCP connection closed by peer, reconnecting");
        }

        let reused = reusable.is_some();
        let mut connection = match reusable {
            Some(connection) => connection,
            None => connect(target).await?,
        };
        if let Err(e) = connection.send(payload.clone()).await {
            if !reused {
                return Err(e.into());
            }
            debug!(%target, "Write on pooled TCP connection failed, retrying once: {}", e);
            connection = connect(target).await?;
            connection.send(payload).await?;
        }
        *slot = Some(connection);
        debug!(message_id = %message.id, %target, "Message sent over TCP");
        Ok(())
    }
}
