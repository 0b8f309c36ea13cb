// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Priority Message Queue
//!
//! Four independent FIFO lanes (critical, high, normal, low) drained strictly
//! in priority order, with a bounded total size and a bounded dead-letter
//! list.
//!
//! - `enqueue` refuses messages already past their TTL (dead-lettered as
//!   `expired`) and refuses anything once the queue is full.
//! - `dequeue` re-checks TTL and dead-letters expired messages it finds
//!   mid-queue instead of returning them.
//!
//! The lanes are guarded by a `parking_lot` mutex that is never held across an
//! `.await`; waiting consumers park on a `tokio::sync::Notify`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::message::{Message, MessageId, MessagePriority};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Message queue is full ({capacity} messages)")]
    Full { capacity: usize },

    #[error("Message {0} expired before it was enqueued")]
    Expired(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    Expired,
    RetriesExhausted,
    /// The outbound retry lane was at capacity.
    RetryLaneFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub expired: u64,
    pub rejected_full: u64,
    pub dead_lettered: u64,
    pub depth: usize,
    pub depth_by_priority: [usize; 4],
}

struct QueueState {
    lanes: [VecDeque<Message>; 4],
    dead_letters: VecDeque<DeadLetter>,
    stats: QueueStats,
}

impl QueueState {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

fn lane_index(priority: MessagePriority) -> usize {
    match priority {
        MessagePriority::Critical => 0,
        MessagePriority::High => 1,
        MessagePriority::Normal => 2,
        MessagePriority::Low => 3,
    }
}

pub struct MessageQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_size: usize,
    dead_letter_capacity: usize,
}

impl MessageQueue {
    pub fn new(max_size: usize, dead_letter_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                lanes: Default::default(),
                dead_letters: VecDeque::new(),
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
            max_size,
            dead_letter_capacity,
        }
    }

    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            if message.is_expired(now) {
                let id = message.id;
                state.stats.expired += 1;
                self.push_dead_letter(&mut state, message, DeadLetterReason::Expired, now);
                return Err(QueueError::Expired(id));
            }
            if state.len() >= self.max_size {
                state.stats.rejected_full += 1;
                metrics::counter!("cohort_queue_rejected_total").increment(1);
                return Err(QueueError::Full {
                    capacity: self.max_size,
                });
            }
            state.lanes[lane_index(message.priority)].push_back(message);
            state.stats.enqueued += 1;
            metrics::gauge!("cohort_queue_depth").set(state.len() as f64);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the highest-priority live message without waiting.
    pub fn try_dequeue(&self) -> Option<Message> {
        let now = Utc::now();
        let mut state = self.state.lock();
        for priority in MessagePriority::DRAIN_ORDER {
            while let Some(message) = state.lanes[lane_index(priority)].pop_front() {
                if message.is_expired(now) {
                    debug!(message_id = %message.id, "Dropping expired message");
                    state.stats.expired += 1;
                    self.push_dead_letter(&mut state, message, DeadLetterReason::Expired, now);
                    continue;
                }
                state.stats.dequeued += 1;
                metrics::gauge!("cohort_queue_depth").set(state.len() as f64);
                return Some(message);
            }
        }
        None
    }

    /// Waits for the next live message. `None` waits indefinitely; `Some(d)`
    /// gives up after `d`.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Message> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_dequeue() {
                return Some(message);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_dequeue();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Records a message that left normal delivery.
    pub fn dead_letter(&self, message: Message, reason: DeadLetterReason) {
        let mut state = self.state.lock();
        self.push_dead_letter(&mut state, message, reason, Utc::now());
    }

    fn push_dead_letter(
        &self,
        state: &mut QueueState,
        message: Message,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) {
        state.stats.dead_lettered += 1;
        metrics::counter!("cohort_dead_letters_total").increment(1);
        if self.dead_letter_capacity == 0 {
            return;
        }
        if state.dead_letters.len() >= self.dead_letter_capacity {
            state.dead_letters.pop_front();
        }
        state.dead_letters.push_back(DeadLetter {
            message,
            reason,
            dead_lettered_at: now,
        });
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn dead_letter_count(&self) -> u64 {
        self.state.lock().stats.dead_lettered
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.depth = state.len();
        for (slot, lane) in stats.depth_by_priority.iter_mut().zip(state.lanes.iter()) {
            *slot = lane.len();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageKind;
    use serde_json::json;
    use std::sync::Arc;

    fn msg(priority: MessagePriority) -> Message {
        Message::new(MessageKind::Command, "core", json!({})).with_priority(priority)
    }

    #[tokio::test]
    async fn test_priority_lanes_drain_in_order() {
        let queue = MessageQueue::new(10, 10);
        for p in [
            MessagePriority::Low,
            MessagePriority::Critical,
            MessagePriority::Normal,
            MessagePriority::High,
        ] {
            queue.enqueue(msg(p)).unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(queue.dequeue(Some(Duration::from_millis(10))).await.unwrap().priority);
        }
        assert_eq!(
            order,
            [
                MessagePriority::Critical,
                MessagePriority::High,
                MessagePriority::Normal,
                MessagePriority::Low
            ]
        );
    }

    #[test]
    fn test_fifo_within_lane() {
        let queue = MessageQueue::new(10, 10);
        let first = msg(MessagePriority::Normal);
        let second = msg(MessagePriority::Normal);
        let (a, b) = (first.id, second.id);
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();
        assert_eq!(queue.try_dequeue().unwrap().id, a);
        assert_eq!(queue.try_dequeue().unwrap().id, b);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_never_delivered() {
        let queue = MessageQueue::new(10, 10);
        let err = queue.enqueue(msg(MessagePriority::High).with_ttl(0)).unwrap_err();
        assert!(matches!(err, QueueError::Expired(_)));
        assert!(queue.dequeue(Some(Duration::from_millis(5))).await.is_none());
        assert_eq!(queue.dead_letter_count(), 1);
        assert_eq!(queue.dead_letters()[0].reason, DeadLetterReason::Expired);
    }

    #[test]
    fn test_expired_mid_queue_is_dropped() {
        let queue = MessageQueue::new(10, 10);
        let mut stale = msg(MessagePriority::Critical).with_ttl(1);
        queue.enqueue(stale.clone()).unwrap();
        // age the queued copy
        {
            let mut state = queue.state.lock();
            stale = state.lanes[0].pop_front().unwrap();
            stale.timestamp -= chrono::Duration::seconds(5);
            state.lanes[0].push_back(stale);
        }
        let live = msg(MessagePriority::Low);
        let live_id = live.id;
        queue.enqueue(live).unwrap();

        assert_eq!(queue.try_dequeue().unwrap().id, live_id);
        let stats = queue.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = MessageQueue::new(2, 10);
        queue.enqueue(msg(MessagePriority::Low)).unwrap();
        queue.enqueue(msg(MessagePriority::Low)).unwrap();
        assert_eq!(
            queue.enqueue(msg(MessagePriority::Critical)),
            Err(QueueError::Full { capacity: 2 })
        );
        assert_eq!(queue.stats().rejected_full, 1);
    }

    #[test]
    fn test_dead_letter_list_is_bounded() {
        let queue = MessageQueue::new(10, 2);
        for _ in 0..3 {
            queue.dead_letter(msg(MessagePriority::Low), DeadLetterReason::RetriesExhausted);
        }
        assert_eq!(queue.dead_letters().len(), 2);
        assert_eq!(queue.dead_letter_count(), 3);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let queue = Arc::new(MessageQueue::new(10, 10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(None).await })
        };
        tokio::task::yield_now().await;
        let m = msg(MessagePriority::Normal);
        let id = m.id;
        queue.enqueue(m).unwrap();
        assert_eq!(consumer.await.unwrap().unwrap().id, id);
    }
}
