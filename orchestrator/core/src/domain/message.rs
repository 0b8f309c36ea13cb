// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Messages and Subscriptions
//!
//! [`Message`] is the single wire shape carried by the event bus, the priority
//! queue and both transports:
//!
//! ```json
//! {"id": "...", "type": "command", "priority": "normal",
//!  "source_cluster": "core", "target_cluster": "memory",
//!  "source_agent": null, "target_agent": null,
//!  "payload": {...}, "headers": {...}, "timestamp": "...",
//!  "ttl": 300, "correlation_id": null, "reply_to": null,
//!  "retries": 0, "max_retries": 3}
//! ```
//!
//! A message is immutable once enqueued except for its retry counter.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::domain::cluster::{AgentId, ClusterId};

pub const DEFAULT_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Query,
    Event,
    Response,
    Heartbeat,
    Broadcast,
    Notification,
}

/// Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// Drain order of the priority lanes.
    pub const DRAIN_ORDER: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub source_cluster: ClusterId,
    pub target_cluster: Option<ClusterId>,
    pub source_agent: Option<AgentId>,
    pub target_agent: Option<AgentId>,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Time to live in whole seconds.
    pub ttl: u64,
    #[serde(default)]
    pub correlation_id: Option<MessageId>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
}

impl Message {
    pub fn new(kind: MessageKind, source_cluster: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            priority: MessagePriority::default(),
            source_cluster: ClusterId::new(source_cluster),
            target_cluster: None,
            source_agent: None,
            target_agent: None,
            payload,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            ttl: DEFAULT_TTL_SECS,
            correlation_id: None,
            reply_to: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.target_cluster = Some(ClusterId::new(cluster));
        self
    }

    pub fn with_source_agent(mut self, agent: impl Into<String>) -> Self {
        self.source_agent = Some(AgentId::new(agent));
        self
    }

    pub fn with_target_agent(mut self, agent: impl Into<String>) -> Self {
        self.target_agent = Some(AgentId::new(agent));
        self
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = ttl_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Builds a response correlated with this message.
    pub fn reply(&self, source_cluster: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut response = Message::new(MessageKind::Response, source_cluster, payload)
            .with_priority(self.priority);
        response.target_cluster = Some(self.source_cluster.clone());
        response.target_agent = self.source_agent.clone();
        response.correlation_id = Some(self.id);
        response
    }

    /// True once `now ≥ timestamp + ttl`; a zero TTL is expired on arrival.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.ttl).unwrap_or(i64::MAX);
        let deadline = self
            .timestamp
            .checked_add_signed(chrono::Duration::seconds(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        now >= deadline
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Serialized form that routing rules and subscription patterns match
    /// against.
    pub fn match_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Unique identifier of an event bus subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
enum Pattern {
    Any,
    Regex(Regex),
}

/// Interest of one cluster/agent in a class of messages.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
    matcher: Pattern,
    pub owner_cluster: ClusterId,
    pub owner_agent: Option<AgentId>,
    /// `None` accepts every kind.
    pub kinds: Option<HashSet<MessageKind>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// `"*"` matches every message; anything else is a regular expression
    /// applied to [`Message::match_text`].
    pub fn new(
        pattern: impl Into<String>,
        owner_cluster: ClusterId,
        owner_agent: Option<AgentId>,
        kinds: Option<HashSet<MessageKind>>,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let matcher = if pattern == "*" {
            Pattern::Any
        } else {
            Pattern::Regex(Regex::new(&pattern)?)
        };
        Ok(Self {
            id: SubscriptionId::new(),
            pattern,
            matcher,
            owner_cluster,
            owner_agent,
            kinds,
            active: true,
            created_at: Utc::now(),
        })
    }

    pub fn accepts(&self, message: &Message, match_text: &str) -> bool {
        if !self.active {
            return false;
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&message.kind) {
                return false;
            }
        }
        match &self.matcher {
            Pattern::Any => true,
            Pattern::Regex(regex) => regex.is_match(match_text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_uses_type_field() {
        let msg = Message::new(MessageKind::Command, "core", json!({"op": "run"}))
            .with_target_cluster("memory");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["priority"], "normal");
        assert_eq!(value["target_cluster"], "memory");
        assert_eq!(value["ttl"], 300);
        assert!(value.get("correlation_id").is_some());

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let raw = json!({
            "id": Uuid::new_v4(), "type": "event", "priority": "high",
            "source_cluster": "a", "target_cluster": null,
            "source_agent": null, "target_agent": null,
            "payload": {}, "headers": {}, "timestamp": Utc::now(),
            "ttl": 10, "retries": 0, "max_retries": 3
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert!(msg.correlation_id.is_none());
        assert_eq!(msg.priority, MessagePriority::High);
    }

    #[test]
    fn test_ttl_expiry() {
        let now = Utc::now();
        let mut msg = Message::new(MessageKind::Event, "a", json!(null)).with_ttl(0);
        msg.timestamp = now;
        assert!(msg.is_expired(now));

        let mut msg = msg.with_ttl(5);
        msg.timestamp = now;
        assert!(!msg.is_expired(now + chrono::Duration::seconds(4)));
        assert!(msg.is_expired(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_reply_is_correlated() {
        let request = Message::new(MessageKind::Query, "core", json!({})).with_source_agent("a1");
        let reply = request.reply("memory", json!({"ok": true}));
        assert_eq!(reply.correlation_id, Some(request.id));
        assert_eq!(reply.target_cluster, Some(ClusterId::from("core")));
        assert_eq!(reply.target_agent, Some(AgentId::from("a1")));
    }

    #[test]
    fn test_subscription_kind_filter_and_pattern() {
        let msg = Message::new(MessageKind::Event, "core", json!({"topic": "scaling"}));
        let text = msg.match_text();

        let any = Subscription::new("*", ClusterId::from("x"), None, None).unwrap();
        assert!(any.accepts(&msg, &text));

        let kinds = HashSet::from([MessageKind::Command]);
        let commands_only = Subscription::new("*", ClusterId::from("x"), None, Some(kinds)).unwrap();
        assert!(!commands_only.accepts(&msg, &text));

        let topical = Subscription::new("scaling", ClusterId::from("x"), None, None).unwrap();
        assert!(topical.accepts(&msg, &text));
        let other = Subscription::new("failover", ClusterId::from("x"), None, None).unwrap();
        assert!(!other.accepts(&msg, &text));

        assert!(Subscription::new("(", ClusterId::from("x"), None, None).is_err());
    }
}
