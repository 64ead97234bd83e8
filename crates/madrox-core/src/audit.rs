//! Structured JSONL audit logging with live broadcast.
//!
//! Audit records are typed events written to a daily-rotated JSON-lines file
//! (`audit-YYYY-MM-DD.jsonl` under the log directory) and fanned out to any
//! WebSocket subscribers. Emission is best-effort: a failed file write is
//! reported on the system stream and never propagates to the caller.

use crate::logging::log_dir;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tracing::warn;

const AUDIT_CHANNEL_CAPACITY: usize = 512;

static AUDIT_TX: OnceLock<broadcast::Sender<AuditEvent>> = OnceLock::new();

/// Typed audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    InstanceSpawn,
    InstanceTerminate,
    MessageSent,
    MessageReceived,
    StateChange,
    Error,
    Timeout,
    QueueOverflow,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstanceSpawn => "instance_spawn",
            Self::InstanceTerminate => "instance_terminate",
            Self::MessageSent => "message_sent",
            Self::MessageReceived => "message_received",
            Self::StateChange => "state_change",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: AuditEventType,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_session_id: Option<String>,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            action: action.into(),
            instance_id: None,
            team_session_id: None,
            metadata: Value::Null,
        }
    }

    pub fn instance(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn team(mut self, team: Option<String>) -> Self {
        self.team_session_id = team;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

fn audit_tx() -> &'static broadcast::Sender<AuditEvent> {
    AUDIT_TX.get_or_init(|| broadcast::channel(AUDIT_CHANNEL_CAPACITY).0)
}

/// Subscribe to the live audit stream.
pub fn subscribe_audit() -> broadcast::Receiver<AuditEvent> {
    audit_tx().subscribe()
}

/// Today's audit file. Daily rotation happens by construction: the UTC date
/// is part of the filename, so the first event after midnight opens a new
/// file and prior files are never touched again.
fn audit_path() -> std::path::PathBuf {
    log_dir().join(format!("audit-{}.jsonl", Utc::now().format("%Y-%m-%d")))
}

/// Emit an audit event to the daily file and the live stream.
///
/// Best-effort: file errors are logged on the system stream and swallowed so
/// audit plumbing can never fail an operation it is recording.
pub fn emit(event: AuditEvent) {
    if let Ok(line) = serde_json::to_string(&event) {
        let path = audit_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    warn!("audit append failed: {e}");
                }
            }
            Err(e) => warn!("audit file open failed: {e}"),
        }
    }
    let _ = audit_tx().send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn emit_writes_jsonl_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MADROX_LOG_DIR", dir.path());
        let mut rx = subscribe_audit();

        emit(
            AuditEvent::new(AuditEventType::InstanceSpawn, "spawn")
                .instance("abc")
                .metadata(serde_json::json!({"name": "worker"})),
        );

        let got = rx.try_recv().unwrap();
        assert_eq!(got.event_type, AuditEventType::InstanceSpawn);
        assert_eq!(got.instance_id.as_deref(), Some("abc"));

        let path = audit_path();
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: AuditEvent = serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(parsed.action, "spawn");
        std::env::remove_var("MADROX_LOG_DIR");
    }

    #[test]
    fn event_type_wire_strings() {
        assert_eq!(AuditEventType::QueueOverflow.as_str(), "queue_overflow");
        assert_eq!(AuditEventType::StateChange.as_str(), "state_change");
    }
}
