//! Message envelopes and bounded per-instance queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default cap for inboxes and reply queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What a message is, from the bus's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Reply,
    Broadcast,
}

/// One message travelling between instances.
///
/// `correlation_id` is sender-chosen and opaque; the bus matches on equality
/// only and never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub correlation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub kind: MessageKind,
}

impl MessageEnvelope {
    pub fn new(
        correlation_id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            payload: payload.into(),
            created_at: Utc::now(),
            kind,
        }
    }
}

/// Bounded FIFO queue. On overflow the **oldest** entry is dropped so the
/// newest messages are preserved.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    items: VecDeque<MessageEnvelope>,
    capacity: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl MessageQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push a message, returning the dropped entry when the cap was hit.
    /// The caller is responsible for emitting the `queue_overflow` audit.
    pub fn push(&mut self, msg: MessageEnvelope) -> Option<MessageEnvelope> {
        let dropped = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(msg);
        dropped
    }

    /// Remove and return all queued messages, order preserved.
    pub fn drain(&mut self) -> Vec<MessageEnvelope> {
        self.items.drain(..).collect()
    }

    /// Remove the first message matching `correlation_id`, if any.
    pub fn take_by_correlation(&mut self, correlation_id: &str) -> Option<MessageEnvelope> {
        let idx = self
            .items
            .iter()
            .position(|m| m.correlation_id == correlation_id)?;
        self.items.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageEnvelope> {
        self.items.iter()
    }
}
