// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pattern-matched Pub/Sub for Messages
//
// Subscriptions pair a pattern and an optional kind filter with an async
// handler. Matching handlers run concurrently; a failing handler is counted
// and logged but never aborts delivery to the others.
//
// Every published message is also fanned out on a tokio broadcast channel so
// observers can stream traffic without registering a subscription.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::cluster::{AgentId, ClusterId};
use crate::domain::message::{Message, MessageKind, Subscription, SubscriptionId};

/// Callback invoked for every message a subscription accepts.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

/// Delivery counters since the bus was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub unmatched: u64,
    pub subscriptions: usize,
}

/// Read-only view of a registered subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub owner_cluster: ClusterId,
    pub owner_agent: Option<AgentId>,
    pub kinds: Option<HashSet<MessageKind>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
}

pub struct EventBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Entry>>,
    history: Mutex<VecDeque<Message>>,
    history_size: usize,
    stats: Mutex<EventBusStats>,
    tap: broadcast::Sender<Message>,
}

impl EventBus {
    /// `history_size` bounds the diagnostic history; `tap_capacity` is the
    /// broadcast buffer for observers.
    pub fn new(history_size: usize, tap_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(tap_capacity.max(1));
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_size,
            stats: Mutex::new(EventBusStats::default()),
            tap,
        }
    }

    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        owner: ClusterId,
        kinds: Option<HashSet<MessageKind>>,
    ) -> Result<SubscriptionId, EventBusError> {
        self.subscribe_agent(pattern, handler, owner, None, kinds)
    }

    pub fn subscribe_agent(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
        owner: ClusterId,
        owner_agent: Option<AgentId>,
        kinds: Option<HashSet<MessageKind>>,
    ) -> Result<SubscriptionId, EventBusError> {
        let subscription = Subscription::new(pattern, owner, owner_agent, kinds).map_err(|source| {
            EventBusError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        let id = subscription.id;
        debug!(subscription_id = %id, pattern, "Subscription registered");
        self.subscriptions.write().insert(
            id,
            Entry {
                subscription,
                handler,
            },
        );
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), EventBusError> {
        self.subscriptions
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(EventBusError::SubscriptionNotFound(id))
    }

    pub fn set_active(&self, id: SubscriptionId, active: bool) -> Result<(), EventBusError> {
        let mut subscriptions = self.subscriptions.write();
        let entry = subscriptions
            .get_mut(&id)
            .ok_or(EventBusError::SubscriptionNotFound(id))?;
        entry.subscription.active = active;
        Ok(())
    }

    /// Delivers `message` to every accepting subscription and returns how
    /// many handlers completed successfully.
    pub async fn publish(&self, message: Message) -> usize {
        let text = message.match_text();
        let targets: Vec<(SubscriptionId, Arc<dyn MessageHandler>)> = self
            .subscriptions
            .read()
            .values()
            .filter(|entry| entry.subscription.accepts(&message, &text))
            .map(|entry| (entry.subscription.id, entry.handler.clone()))
            .collect();

        self.record_history(&message);
        // No receivers is the common case; nothing to report.
        let _ = self.tap.send(message.clone());

        let results = join_all(targets.iter().map(|(id, handler)| {
            let message = message.clone();
            async move { (*id, handler.handle(message).await) }
        }))
        .await;

        let mut delivered = 0usize;
        let mut failed = 0u64;
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!(subscription_id = %id, message_id = %message.id, "Message handler failed: {}", e);
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.published += 1;
            stats.delivered += delivered as u64;
            stats.failed += failed;
            if targets.is_empty() {
                stats.unmatched += 1;
            }
        }
        metrics::counter!("cohort_bus_messages_published_total").increment(1);
        metrics::counter!("cohort_bus_deliveries_total").increment(delivered as u64);
        if failed > 0 {
            metrics::counter!("cohort_bus_delivery_failures_total").increment(failed);
        }

        debug!(message_id = %message.id, delivered, failed, "Message published");
        delivered
    }

    fn record_history(&self, message: &Message) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(message.clone());
    }

    /// Most recent messages, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Message> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .read()
            .values()
            .map(|entry| SubscriptionInfo {
                id: entry.subscription.id,
                pattern: entry.subscription.pattern.clone(),
                owner_cluster: entry.subscription.owner_cluster.clone(),
                owner_agent: entry.subscription.owner_agent.clone(),
                kinds: entry.subscription.kinds.clone(),
                active: entry.subscription.active,
                created_at: entry.subscription.created_at,
            })
            .collect()
    }

    pub fn stats(&self) -> EventBusStats {
        let mut stats = self.stats.lock().clone();
        stats.subscriptions = self.subscriptions.read().len();
        stats
    }

    /// Observer stream of every published message.
    pub fn tap(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.tap.subscribe(),
        }
    }

    pub fn tap_count(&self) -> usize {
        self.tap.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000, 1000)
    }
}

/// Receiver side of [`EventBus::tap`].
pub struct EventReceiver {
    receiver: broadcast::Receiver<Message>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<Message, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} messages", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<Message, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} messages", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No messages available")]
    Empty,

    #[error("Receiver lagged by {0} messages (messages were dropped)")]
    Lagged(u64),

    #[error("Invalid subscription pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),
}
