//! Bidirectional message bus.
//!
//! Each instance owns a bounded inbox (messages sent to it) and a bounded
//! reply queue (replies it has issued, awaiting pickup by its parent). A
//! parent that asked to wait is parked on a oneshot waiter keyed by
//! `(recipient_id, correlation_id)`; a reply with no waiter stays in the
//! queue until drained, and a waiter that times out is removed so a late
//! reply falls back to the queue.
//!
//! Correlation ids are opaque: the bus matches on equality only. It does
//! remember every id it has seen so that reuse within a team session is
//! rejected and a correlation id passed where an instance id belongs can be
//! called out explicitly.

use madrox_core::audit::{emit, AuditEvent, AuditEventType};
use madrox_core::{MessageEnvelope, MessageQueue};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Bus-level errors; the manager maps them onto the tool taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("correlation id '{0}' was already used in this team session")]
    CorrelationReused(String),

    #[error("no queues registered for instance '{0}'")]
    UnknownInstance(String),
}

#[derive(Default)]
struct BusInner {
    inboxes: HashMap<String, MessageQueue>,
    reply_queues: HashMap<String, MessageQueue>,
    waiters: HashMap<(String, String), oneshot::Sender<MessageEnvelope>>,
    /// correlation id → team session scope it was first used in.
    correlations: HashMap<String, Option<String>>,
}

/// Process-wide message bus. Share behind an `Arc`.
#[derive(Default)]
pub struct MessageBus {
    inner: Mutex<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate queues for a freshly spawned instance.
    pub fn register_instance(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.entry(id.to_string()).or_default();
        inner.reply_queues.entry(id.to_string()).or_default();
    }

    /// Record a correlation id, rejecting reuse within the same team session.
    pub fn record_correlation(
        &self,
        team_session_id: Option<&str>,
        correlation_id: &str,
    ) -> Result<(), BusError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(scope) = inner.correlations.get(correlation_id) {
            if scope.as_deref() == team_session_id {
                return Err(BusError::CorrelationReused(correlation_id.to_string()));
            }
        }
        inner.correlations.insert(
            correlation_id.to_string(),
            team_session_id.map(str::to_string),
        );
        Ok(())
    }

    /// Whether `id` is a correlation id the bus has seen. Used to reject
    /// correlation ids passed where an instance id belongs.
    pub fn is_known_correlation(&self, id: &str) -> bool {
        self.inner.lock().unwrap().correlations.contains_key(id)
    }

    /// Enqueue a message on the recipient's inbox. Overflow drops the oldest
    /// entry and emits a `queue_overflow` audit event.
    pub fn push_inbox(&self, recipient_id: &str, msg: MessageEnvelope) -> Result<(), BusError> {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            let queue = inner
                .inboxes
                .get_mut(recipient_id)
                .ok_or_else(|| BusError::UnknownInstance(recipient_id.to_string()))?;
            queue.push(msg)
        };
        if let Some(dropped) = dropped {
            emit(
                AuditEvent::new(AuditEventType::QueueOverflow, "inbox_overflow")
                    .instance(recipient_id)
                    .metadata(json!({
                        "dropped_correlation_id": dropped.correlation_id,
                        "dropped_sender_id": dropped.sender_id,
                    })),
            );
        }
        Ok(())
    }

    /// Drain an instance's inbox, order preserved.
    pub fn drain_inbox(&self, id: &str) -> Result<Vec<MessageEnvelope>, BusError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .inboxes
            .get_mut(id)
            .map(MessageQueue::drain)
            .ok_or_else(|| BusError::UnknownInstance(id.to_string()))
    }

    /// Number of messages waiting in an instance's inbox.
    pub fn inbox_len(&self, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .inboxes
            .get(id)
            .map(MessageQueue::len)
            .unwrap_or(0)
    }

    /// Deliver a reply issued by `sender_id` (the child). A parked waiter for
    /// `(sender_id, correlation_id)` consumes it directly; otherwise it is
    /// enqueued on the child's reply queue for later pickup.
    pub fn deliver_reply(&self, sender_id: &str, reply: MessageEnvelope) -> Result<(), BusError> {
        let key = (sender_id.to_string(), reply.correlation_id.clone());
        let undelivered = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.reply_queues.contains_key(sender_id) {
                return Err(BusError::UnknownInstance(sender_id.to_string()));
            }
            match inner.waiters.remove(&key) {
                // A dropped receiver hands the reply back; fall through to
                // the queue so nothing is lost.
                Some(waiter) => waiter.send(reply).err(),
                None => Some(reply),
            }
        };
        if let Some(reply) = undelivered {
            let dropped = {
                let mut inner = self.inner.lock().unwrap();
                let queue = inner
                    .reply_queues
                    .get_mut(sender_id)
                    .ok_or_else(|| BusError::UnknownInstance(sender_id.to_string()))?;
                queue.push(reply)
            };
            if let Some(dropped) = dropped {
                emit(
                    AuditEvent::new(AuditEventType::QueueOverflow, "reply_queue_overflow")
                        .instance(sender_id)
                        .metadata(json!({
                            "dropped_correlation_id": dropped.correlation_id,
                        })),
                );
            }
        } else {
            debug!("reply for ({sender_id}) consumed by waiter");
        }
        Ok(())
    }

    /// Drain an instance's reply queue, order preserved.
    pub fn drain_replies(&self, id: &str) -> Result<Vec<MessageEnvelope>, BusError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .reply_queues
            .get_mut(id)
            .map(MessageQueue::drain)
            .ok_or_else(|| BusError::UnknownInstance(id.to_string()))
    }

    /// Block up to `timeout` for a reply from `recipient_id` matching
    /// `correlation_id`. Returns `None` on timeout; the waiter is removed so
    /// a late reply lands in the queue instead.
    pub async fn wait_for_reply(
        &self,
        recipient_id: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Option<MessageEnvelope> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            // The reply may have arrived before the waiter registered.
            if let Some(queue) = inner.reply_queues.get_mut(recipient_id) {
                if let Some(early) = queue.take_by_correlation(correlation_id) {
                    return Some(early);
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(
                (recipient_id.to_string(), correlation_id.to_string()),
                tx,
            );
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            // Timeout or sender dropped: cancel the waiter. The message
            // itself still delivers via the reply queue.
            _ => {
                let mut inner = self.inner.lock().unwrap();
                inner
                    .waiters
                    .remove(&(recipient_id.to_string(), correlation_id.to_string()));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use madrox_core::MessageKind;

    fn reply(corr: &str, payload: &str) -> MessageEnvelope {
        MessageEnvelope::new(corr, "child", "parent", payload, MessageKind::Reply)
    }

    #[test]
    fn correlation_reuse_rejected_within_team() {
        let bus = MessageBus::new();
        bus.record_correlation(Some("team-x"), "K1").unwrap();
        assert!(matches!(
            bus.record_correlation(Some("team-x"), "K1"),
            Err(BusError::CorrelationReused(_))
        ));
        // A different team session may use the same opaque string.
        assert!(bus.record_correlation(Some("team-y"), "K1").is_ok());
        assert!(bus.is_known_correlation("K1"));
        assert!(!bus.is_known_correlation("K2"));
    }

    #[test]
    fn reply_without_waiter_stays_queued() {
        let bus = MessageBus::new();
        bus.register_instance("child");
        bus.deliver_reply("child", reply("K1", "y")).unwrap();
        let drained = bus.drain_replies("child").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, "y");
        // Second drain is empty.
        assert!(bus.drain_replies("child").unwrap().is_empty());
    }

    #[tokio::test]
    async fn waiter_consumes_matching_reply() {
        let bus = std::sync::Arc::new(MessageBus::new());
        bus.register_instance("child");

        let bus2 = bus.clone();
        let waiter = tokio::spawn(async move {
            bus2.wait_for_reply("child", "K1", Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.deliver_reply("child", reply("K1", "answer")).unwrap();

        let got = waiter.await.unwrap().expect("reply delivered");
        assert_eq!(got.payload, "answer");
        // Consumed by the waiter: nothing left to drain.
        assert!(bus.drain_replies("child").unwrap().is_empty());
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_late_reply_in_queue() {
        let bus = MessageBus::new();
        bus.register_instance("child");
        let got = bus
            .wait_for_reply("child", "K1", Duration::from_millis(20))
            .await;
        assert!(got.is_none());
        // Late reply lands in the queue.
        bus.deliver_reply("child", reply("K1", "late")).unwrap();
        let drained = bus.drain_replies("child").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, "late");
    }

    #[tokio::test]
    async fn early_reply_found_without_parking() {
        let bus = MessageBus::new();
        bus.register_instance("child");
        bus.deliver_reply("child", reply("K1", "early")).unwrap();
        let got = bus
            .wait_for_reply("child", "K1", Duration::from_millis(20))
            .await
            .expect("early reply");
        assert_eq!(got.payload, "early");
    }

    #[test]
    fn inbox_fifo_per_recipient() {
        let bus = MessageBus::new();
        bus.register_instance("r");
        for payload in ["m1", "m2", "m3"] {
            bus.push_inbox(
                "r",
                MessageEnvelope::new(payload, "s", "r", payload, MessageKind::Request),
            )
            .unwrap();
        }
        let drained = bus.drain_inbox("r").unwrap();
        let order: Vec<_> = drained.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(order, ["m1", "m2", "m3"]);
    }

    #[test]
    fn unknown_instance_is_an_error() {
        let bus = MessageBus::new();
        assert!(matches!(
            bus.push_inbox(
                "ghost",
                MessageEnvelope::new("k", "s", "ghost", "x", MessageKind::Request)
            ),
            Err(BusError::UnknownInstance(_))
        ));
        assert!(bus.drain_replies("ghost").is_err());
    }
}
