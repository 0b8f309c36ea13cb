// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Broker
//!
//! Ties the [`EventBus`], the priority [`MessageQueue`] and the pluggable
//! transports together.
//!
//! ```text
//!  transport ──receive_message──► MessageQueue ──drain worker──► EventBus ──► handlers
//!  send_message(Internal) ───────────────────────────────────────► EventBus
//!  send_message(Http|Tcp) ──► TransportHandler ──fail──► retry lane ──exhausted──► dead letters
//! ```
//!
//! Two background loops run while the broker is started: the drain worker
//! and the outbound retry loop. Both stop through the `CancellationToken`
//! issued by the current `start`.
//!
//! The retry lane holds at most `max_queue_size` sends. A message whose TTL
//! has passed is dead-lettered as expired instead of being sent.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::cluster::ClusterId;
use crate::domain::config::{BrokerConfig, ConfigError, TransportBinding};
use crate::domain::events::CoordinationEvent;
use crate::domain::message::{Message, MessageKind, SubscriptionId};
use crate::infrastructure::event_bus::{EventBus, EventBusError, EventBusStats, MessageHandler};
use crate::infrastructure::message_queue::{DeadLetterReason, MessageQueue, QueueError, QueueStats};
use crate::infrastructure::transport::http::HttpTransport;
use crate::infrastructure::transport::tcp::TcpTransport;
use crate::infrastructure::transport::{Protocol, TransportError, TransportHandler};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Subscription(#[from] EventBusError),

    #[error("No transport registered for protocol {0}")]
    NoTransport(Protocol),

    #[error("A target address is required for protocol {0}")]
    MissingTarget(Protocol),

    #[error("Message broker is already running")]
    AlreadyRunning,
}

/// Outcome of [`MessageBroker::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryReport {
    Delivered { receivers: usize },
    RetryScheduled { attempt: u32 },
    DeadLettered,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerMetrics {
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub retries_scheduled: u64,
    pub retries_pending: usize,
    pub queue: QueueStats,
    pub bus: EventBusStats,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    rejected: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    retries_scheduled: AtomicU64,
}

struct PendingRetry {
    message: Message,
    protocol: Protocol,
    target: String,
    not_before: Instant,
}

struct Shared {
    bus: Arc<EventBus>,
    queue: Arc<MessageQueue>,
    counters: Counters,
    retry_lane: Mutex<VecDeque<PendingRetry>>,
}

/// Cloneable handle given to transports for inbound delivery and metrics.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<Shared>,
}

impl BrokerHandle {
    /// Enqueues an inbound message for local delivery.
    pub fn receive_message(&self, message: Message) -> Result<(), QueueError> {
        self.shared.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cohort_broker_received_total").increment(1);
        self.shared.queue.enqueue(message).inspect_err(|e| {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Inbound message rejected: {}", e);
        })
    }

    pub fn metrics(&self) -> BrokerMetrics {
        let counters = &self.shared.counters;
        BrokerMetrics {
            messages_received: counters.received.load(Ordering::Relaxed),
            messages_rejected: counters.rejected.load(Ordering::Relaxed),
            messages_sent: counters.sent.load(Ordering::Relaxed),
            send_failures: counters.send_failures.load(Ordering::Relaxed),
            retries_scheduled: counters.retries_scheduled.load(Ordering::Relaxed),
            retries_pending: self.shared.retry_lane.lock().len(),
            queue: self.shared.queue.stats(),
            bus: self.shared.bus.stats(),
        }
    }
}

pub struct MessageBroker {
    config: BrokerConfig,
    handle: BrokerHandle,
    transports: RwLock<HashMap<Protocol, Arc<dyn TransportHandler>>>,
    shutdown_token: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let shared = Shared {
            bus: Arc::new(EventBus::new(config.history_size, config.event_tap_capacity)),
            queue: Arc::new(MessageQueue::new(config.max_queue_size, config.dead_letter_capacity)),
            counters: Counters::default(),
            retry_lane: Mutex::new(VecDeque::new()),
        };
        Ok(Self {
            config,
            handle: BrokerHandle {
                shared: Arc::new(shared),
            },
            transports: RwLock::new(HashMap::new()),
            shutdown_token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Registers the HTTP and TCP transports.
    pub fn with_default_transports(self) -> Self {
        self.register_transport(Arc::new(HttpTransport::new(self.handle.clone())));
        self.register_transport(Arc::new(TcpTransport::new(self.handle.clone())));
        self
    }

    pub fn register_transport(&self, transport: Arc<dyn TransportHandler>) {
        self.transports.write().insert(transport.protocol(), transport);
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.handle.shared.bus.clone()
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        self.handle.shared.queue.clone()
    }

    pub fn metrics(&self) -> BrokerMetrics {
        self.handle.metrics()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        owner: ClusterId,
        kinds: Option<HashSet<MessageKind>>,
    ) -> Result<SubscriptionId, BrokerError> {
        Ok(self.handle.shared.bus.subscribe(pattern, handler, owner, kinds)?)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        Ok(self.handle.shared.bus.unsubscribe(id)?)
    }

    /// Direct local publish; returns the number of successful deliveries.
    pub async fn publish(&self, message: Message) -> usize {
        self.handle.shared.bus.publish(message).await
    }

    pub fn receive_message(&self, message: Message) -> Result<(), BrokerError> {
        Ok(self.handle.receive_message(message)?)
    }

    /// Publishes a coordination event as an `event`-kind message.
    pub async fn publish_event(&self, event: CoordinationEvent) -> usize {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = event.topic(), "Failed to serialize coordination event: {}", e);
                return 0;
            }
        };
        let message = Message::new(MessageKind::Event, event.cluster_id().as_str(), payload)
            .with_header("topic", event.topic());
        self.publish(message).await
    }

    /// Sends a message over `protocol`.
    ///
    /// `Internal` publishes straight to the bus. External protocols go through
    /// the registered transport; a failed send is parked on the retry lane
    /// until `max_retries` is exhausted, after which it is dead-lettered.
    pub async fn send_message(
        &self,
        message: Message,
        protocol: Protocol,
        target: Option<&str>,
    ) -> Result<DeliveryReport, BrokerError> {
        if protocol == Protocol::Internal {
            let receivers = self.publish(message).await;
            return Ok(DeliveryReport::Delivered { receivers });
        }
        let target = target.ok_or(BrokerError::MissingTarget(protocol))?;
        let transport = self
            .transports
            .read()
            .get(&protocol)
            .cloned()
            .ok_or(BrokerError::NoTransport(protocol))?;
        Ok(self.deliver(transport, message, protocol, target.to_string()).await)
    }

    async fn deliver(
        &self,
        transport: Arc<dyn TransportHandler>,
        message: Message,
        protocol: Protocol,
        target: String,
    ) -> DeliveryReport {
        let counters = &self.handle.shared.counters;
        if message.is_expired(Utc::now()) {
            debug!(message_id = %message.id, target = %target, "Message expired before sending, dead-lettering");
            self.handle.shared.queue.dead_letter(message, DeadLetterReason::Expired);
            return DeliveryReport::DeadLettered;
        }
        match transport.send(&message, &target).await {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cohort_broker_sent_total", "protocol" => protocol.to_string()).increment(1);
                DeliveryReport::Delivered { receivers: 1 }
            }
            Err(e) => {
                counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message.id, %protocol, target = %target, "Transport send failed: {}", e);
                self.schedule_retry(message, protocol, target)
            }
        }
    }

    fn schedule_retry(&self, mut message: Message, protocol: Protocol, target: String) -> DeliveryReport {
        if !message.can_retry() {
            info!(message_id = %message.id, retries = message.retries, "Retries exhausted, dead-lettering message");
            self.handle
                .shared
                .queue
                .dead_letter(message, DeadLetterReason::RetriesExhausted);
            return DeliveryReport::DeadLettered;
        }
        let mut lane = self.handle.shared.retry_lane.lock();
        if lane.len() >= self.config.max_queue_size {
            drop(lane);
            warn!(message_id = %message.id, capacity = self.config.max_queue_size, "Retry lane full, dead-lettering message");
            self.handle
                .shared
                .queue
                .dead_letter(message, DeadLetterReason::RetryLaneFull);
            return DeliveryReport::DeadLettered;
        }
        message.retries += 1;
        let attempt = message.retries;
        self.handle.shared.counters.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        lane.push_back(PendingRetry {
            message,
            protocol,
            target,
            not_before: Instant::now() + self.config.retry_interval,
        });
        DeliveryReport::RetryScheduled { attempt }
    }

    /// Re-attempts every parked send that is due. Returns how many were
    /// attempted.
    pub async fn process_retries(&self) -> usize {
        let now = Instant::now();
        let due: Vec<PendingRetry> = {
            let mut lane = self.handle.shared.retry_lane.lock();
            let (due, waiting): (VecDeque<_>, VecDeque<_>) =
                lane.drain(..).partition(|p| p.not_before <= now);
            *lane = waiting;
            due.into_iter().collect()
        };
        let attempted = due.len();
        for pending in due {
            let transport = self.transports.read().get(&pending.protocol).cloned();
            match transport {
                Some(transport) => {
                    self.deliver(transport, pending.message, pending.protocol, pending.target)
                        .await;
                }
                None => {
                    warn!(protocol = %pending.protocol, "Transport removed, dead-lettering pending retry");
                    self.handle
                        .shared
                        .queue
                        .dead_letter(pending.message, DeadLetterReason::RetriesExhausted);
                }
            }
        }
        attempted
    }

    /// Starts configured transports and the background loops. Returns the
    /// bound address of each started transport.
    pub async fn start(self: &Arc<Self>) -> Result<HashMap<Protocol, SocketAddr>, BrokerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyRunning);
        }

        let mut bound = HashMap::new();
        let bindings: [(Protocol, &Option<TransportBinding>); 2] =
            [(Protocol::Http, &self.config.http), (Protocol::Tcp, &self.config.tcp)];
        for (protocol, binding) in bindings {
            let Some(binding) = binding else { continue };
            let transport = self
                .transports
                .read()
                .get(&protocol)
                .cloned()
                .ok_or(BrokerError::NoTransport(protocol))?;
            let address = match transport.start(&binding.host, binding.port).await {
                Ok(address) => address,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            };
            info!(%protocol, %address, "Transport listening");
            bound.insert(protocol, address);
        }

        let shutdown = CancellationToken::new();
        *self.shutdown_token.lock() = shutdown.clone();
        let drain = {
            let broker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { broker.run_drain_worker(shutdown).await })
        };
        let retry = {
            let broker = self.clone();
            tokio::spawn(async move { broker.run_retry_loop(shutdown).await })
        };
        self.tasks.lock().extend([drain, retry]);

        info!("Message broker started");
        Ok(bound)
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.lock().cancel();

        let transports: Vec<_> = self.transports.read().values().cloned().collect();
        for transport in transports {
            if let Err(e) = transport.stop().await {
                warn!(protocol = %transport.protocol(), "Failed to stop transport: {}", e);
            }
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Broker task ended abnormally: {}", e);
            }
        }
        info!("Message broker stopped");
    }

    async fn run_drain_worker(&self, shutdown: CancellationToken) {
        let queue = self.queue();
        loop {
            tokio::select! {
                message = queue.dequeue(None) => {
                    if let Some(message) = message {
                        self.publish(message).await;
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Drain worker shutting down");
                    break;
                }
            }
        }
    }

    async fn run_retry_loop(&self, shutdown: CancellationToken) {
        let mut tick = interval(self.config.retry_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let attempted = self.process_retries().await;
                    if attempted > 0 {
                        debug!(attempted, "Retry cycle completed");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Retry loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::event_bus::handler_fn;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FailingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TransportHandler for FailingTransport {
        fn protocol(&self) -> Protocol {
            Protocol::Tcp
        }

        async fn start(&self, _host: &str, _port: u16) -> Result<SocketAddr, TransportError> {
            Err(TransportError::AlreadyStarted)
        }

        async fn stop(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _message: &Message, target: &str) -> Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect {
                target: target.to_string(),
                reason: "refused".into(),
            })
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            retry_interval: Duration::from_millis(1),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_internal_send_publishes_to_bus() {
        let broker = MessageBroker::new(config()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        broker
            .subscribe(
                "*",
                handler_fn(move |_m| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                ClusterId::from("core"),
                None,
            )
            .unwrap();

        let report = broker
            .send_message(Message::new(MessageKind::Command, "a", json!({})), Protocol::Internal, None)
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::Delivered { receivers: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_sends_retry_then_dead_letter() {
        let broker = MessageBroker::new(config()).unwrap();
        let transport = Arc::new(FailingTransport {
            attempts: AtomicUsize::new(0),
        });
        broker.register_transport(transport.clone());

        let message = Message::new(MessageKind::Command, "a", json!({})).with_max_retries(2);
        let report = broker
            .send_message(message, Protocol::Tcp, Some("127.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::RetryScheduled { attempt: 1 });

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(broker.process_retries().await, 1);
        }
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        let metrics = broker.metrics();
        assert_eq!(metrics.retries_pending, 0);
        assert_eq!(metrics.send_failures, 3);
        assert_eq!(broker.queue().dead_letters()[0].reason, DeadLetterReason::RetriesExhausted);
    }

    #[tokio::test]
    async fn test_missing_transport_and_target() {
        let broker = MessageBroker::new(config()).unwrap();
        let msg = Message::new(MessageKind::Command, "a", json!({}));
        assert!(matches!(
            broker.send_message(msg.clone(), Protocol::Http, None).await,
            Err(BrokerError::MissingTarget(Protocol::Http))
        ));
        assert!(matches!(
            broker.send_message(msg, Protocol::Http, Some("x:1")).await,
            Err(BrokerError::NoTransport(Protocol::Http))
        ));
    }

    #[tokio::test]
    async fn test_inbound_is_drained_to_bus() {
        let broker = Arc::new(MessageBroker::new(config()).unwrap());
        let mut tap = broker.bus().tap();
        broker.start().await.unwrap();

        let msg = Message::new(MessageKind::Notification, "remote", json!({"n": 1}));
        let id = msg.id;
        broker.receive_message(msg).unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), tap.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.id, id);
        assert_eq!(broker.metrics().messages_received, 1);
        broker.stop().await;
        assert!(!broker.is_running());
    }

    #[tokio::test]
    async fn test_publish_event_carries_topic() {
        let broker = MessageBroker::new(config()).unwrap();
        let mut tap = broker.bus().tap();
        broker
            .publish_event(CoordinationEvent::ClusterRegistered {
                cluster_id: ClusterId::from("core"),
                registered_at: chrono::Utc::now(),
            })
            .await;
        let msg = tap.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Event);
        assert_eq!(msg.headers.get("topic").map(String::as_str), Some("cluster.registered"));
        assert_eq!(msg.payload["event"], "cluster_registered");
    }

    fn failing_broker(config: BrokerConfig) -> (MessageBroker, Arc<FailingTransport>) {
        let broker = MessageBroker::new(config).unwrap();
        let transport = Arc::new(FailingTransport {
            attempts: AtomicUsize::new(0),
        });
        broker.register_transport(transport.clone());
        (broker, transport)
    }

    #[tokio::test]
    async fn test_expired_message_is_not_sent() {
        let (broker, transport) = failing_broker(config());
        let stale = Message::new(MessageKind::Command, "a", json!({})).with_ttl(0);
        let report = broker
            .send_message(stale, Protocol::Tcp, Some("127.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::DeadLettered);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(broker.queue().dead_letters()[0].reason, DeadLetterReason::Expired);
    }

    #[tokio::test]
    async fn test_message_expiring_on_retry_lane_is_dead_lettered_as_expired() {
        let (broker, transport) = failing_broker(config());
        let mut message = Message::new(MessageKind::Command, "a", json!({}))
            .with_ttl(1)
            .with_max_retries(5);
        message.timestamp = chrono::Utc::now() - chrono::Duration::milliseconds(700);
        let report = broker
            .send_message(message, Protocol::Tcp, Some("127.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::RetryScheduled { attempt: 1 });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(broker.process_retries().await, 1);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.metrics().retries_pending, 0);
        assert_eq!(broker.queue().dead_letters()[0].reason, DeadLetterReason::Expired);
    }

    #[tokio::test]
    async fn test_retry_lane_is_bounded() {
        let (broker, _transport) = failing_broker(BrokerConfig {
            max_queue_size: 1,
            ..config()
        });
        let mut reports = Vec::new();
        for n in 1..=2 {
            let message = Message::new(MessageKind::Command, "a", json!({ "n": n })).with_max_retries(3);
            reports.push(broker.send_message(message, Protocol::Tcp, Some("127.0.0.1:1")).await.unwrap());
        }
        assert_eq!(
            reports,
            [DeliveryReport::RetryScheduled { attempt: 1 }, DeliveryReport::DeadLettered]
        );
        assert_eq!(broker.metrics().retries_pending, 1);
        let dead = broker.queue().dead_letters();
        assert_eq!(dead[0].reason, DeadLetterReason::RetryLaneFull);
        assert_eq!(dead[0].message.payload["n"], 2);
    }

    #[tokio::test]
    async fn test_broker_restarts_after_stop() {
        let broker = Arc::new(MessageBroker::new(config()).unwrap());
        let mut tap = broker.bus().tap();
        broker.start().await.unwrap();
        broker.stop().await;
        broker.start().await.unwrap();

        let msg = Message::new(MessageKind::Notification, "remote", json!({"n": 2}));
        let id = msg.id;
        broker.receive_message(msg).unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(1), tap.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.id, id);
        broker.stop().await;
    }
}
