//! Supervision loop: idle detection and blocked-child advisories.
//!
//! A single periodic task scans every non-terminated instance, refreshes
//! busy/idle from pane quiescence, and intervenes in two non-destructive
//! ways:
//!
//! - **idle**: enqueue a check-in message on the instance's inbox. A
//!   per-instance cooldown plus a last-activity watermark keep the same
//!   stretch of idleness from being nudged twice.
//! - **blocked** (`error` state or a known error signature in the pane):
//!   push an advisory onto the child's reply queue, where the parent's next
//!   `get_pending_replies` poll will find it. Never auto-terminates.
//!
//! The loop's only shared-state writes are timestamps and queue pushes, so
//! it stays single-tasked by design.

use crate::manager::InstanceManager;
use chrono::{DateTime, Utc};
use madrox_core::{InstanceState, MessageEnvelope, MessageKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(300);
/// Minimum spacing between interventions aimed at one instance.
const INTERVENTION_COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Default)]
struct InstanceMemo {
    last_checkin: Option<Instant>,
    /// `last_activity` at the time of the last check-in; the same idle
    /// stretch is never nudged twice.
    checkin_watermark: Option<DateTime<Utc>>,
    last_advisory: Option<Instant>,
    last_tools_executed: u64,
}

pub struct Supervisor {
    manager: Arc<InstanceManager>,
    scan_interval: Duration,
    idle_threshold: Duration,
    memos: HashMap<String, InstanceMemo>,
}

impl Supervisor {
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self {
            manager,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            memos: HashMap::new(),
        }
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    /// Run until the shutdown flag flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "supervisor running (interval {}s, idle threshold {}s)",
            self.scan_interval.as_secs(),
            self.idle_threshold.as_secs()
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("supervisor shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One liveness pass over every non-terminated instance.
    pub async fn scan_once(&mut self) {
        let records = self.manager.registry().snapshot();
        for record in records {
            if record.state.is_terminated() || record.state == InstanceState::Terminating {
                continue;
            }
            if let Err(e) = self.manager.refresh_activity(&record.id).await {
                debug!("activity refresh failed for '{}': {e}", record.id);
            }
            // Re-read: the refresh may have moved the state.
            let Ok(record) = self.manager.registry().get(&record.id) else {
                continue;
            };

            let blocked = record.state == InstanceState::Error
                || self.manager.looks_blocked(&record.id).await;
            if blocked {
                self.advise_parent(&record.id, &record).await;
                continue;
            }

            if self.is_idle(&record) {
                self.check_in(&record.id, record.last_activity);
            }
        }
        self.note_tool_counters();
    }

    fn is_idle(&self, record: &madrox_core::InstanceRecord) -> bool {
        let idle_for = Utc::now()
            .signed_duration_since(record.last_activity)
            .num_seconds();
        if idle_for < self.idle_threshold.as_secs() as i64 {
            return false;
        }
        let memo = self.memos.get(&record.id);
        // Tool executions in the window mean the instance is working, not idle.
        let tools_moved = memo
            .map(|m| record.counters.tools_executed > m.last_tools_executed)
            .unwrap_or(false);
        !tools_moved
    }

    /// Enqueue a non-blocking check-in on the instance's inbox.
    fn check_in(&mut self, id: &str, last_activity: DateTime<Utc>) {
        let memo = self.memos.entry(id.to_string()).or_default();
        if memo.checkin_watermark == Some(last_activity) {
            return;
        }
        if memo
            .last_checkin
            .is_some_and(|t| t.elapsed() < INTERVENTION_COOLDOWN)
        {
            return;
        }

        // The check-in carries its own correlation id so the child can
        // acknowledge via reply_to_caller.
        let correlation_id = format!("supervisor-{}", uuid::Uuid::new_v4());
        let envelope = MessageEnvelope::new(
            &correlation_id,
            "supervisor",
            id,
            "Status check-in: you have been quiet for a while. Reply with reply_to_caller \
             if you are blocked or have results to report.",
            MessageKind::Request,
        );
        match self.manager.bus().push_inbox(id, envelope) {
            Ok(()) => {
                debug!("supervisor check-in enqueued for '{id}'");
                memo.last_checkin = Some(Instant::now());
                memo.checkin_watermark = Some(last_activity);
            }
            Err(e) => warn!("check-in enqueue failed for '{id}': {e}"),
        }
    }

    /// Push a blocked-instance advisory onto the child's reply queue so the
    /// parent's next poll sees it.
    async fn advise_parent(&mut self, id: &str, record: &madrox_core::InstanceRecord) {
        let memo = self.memos.entry(id.to_string()).or_default();
        if memo
            .last_advisory
            .is_some_and(|t| t.elapsed() < INTERVENTION_COOLDOWN)
        {
            return;
        }
        let Some(parent_id) = record.parent_id.clone() else {
            // The root has no parent to advise.
            return;
        };

        let advisory = MessageEnvelope::new(
            format!("supervisor-{}", uuid::Uuid::new_v4()),
            "supervisor",
            &parent_id,
            format!(
                "Supervisor advisory: instance '{}' ({}) appears blocked in state '{}'. \
                 Inspect its pane with get_tmux_pane_content and intervene or terminate.",
                record.name, id, record.state
            ),
            MessageKind::Reply,
        );
        match self.manager.bus().deliver_reply(id, advisory) {
            Ok(()) => {
                info!("supervisor advisory queued for parent of '{id}'");
                memo.last_advisory = Some(Instant::now());
            }
            Err(e) => warn!("advisory enqueue failed for '{id}': {e}"),
        }
    }

    /// Record the per-instance tool counters at the end of a scan so the
    /// next pass can tell whether work happened in the window.
    fn note_tool_counters(&mut self) {
        for record in self.manager.registry().snapshot() {
            self.memos
                .entry(record.id.clone())
                .or_default()
                .last_tools_executed = record.counters.tools_executed;
        }
    }
}
