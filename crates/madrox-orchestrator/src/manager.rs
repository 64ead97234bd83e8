//! Instance manager: the facade every tool handler talks to.
//!
//! Owns the registry, the bus, the terminal backend, and the prompt
//! injector, and wires them together: spawning allocates a workspace and a
//! tmux session, sending routes through the paste-buffer injector and the
//! bus, termination releases the session while keeping the record and the
//! workspace for post-mortem collection.

use crate::artifacts::ArtifactCollector;
use crate::bus::{BusError, MessageBus};
use crate::registry::{InstanceRegistry, RegistryError};
use chrono::Utc;
use madrox_core::audit::{emit, AuditEvent, AuditEventType};
use madrox_core::{
    Config, InstanceKind, InstanceRecord, InstanceState, MessageEnvelope, MessageKind, Role,
    ToolError, ToolErrorKind,
};
use madrox_term::{InjectionPath, PromptInjector, SessionHandle, TermError, TerminalBackend};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a spawned CLI gets to show its banner before the instance is
/// declared ready anyway.
const READY_GRACE: Duration = Duration::from_secs(10);
/// Poll interval while waiting for the banner.
const READY_POLL: Duration = Duration::from_millis(250);
/// Pane quiescence window for the busy → idle transition.
const QUIESCENCE_WINDOW: Duration = Duration::from_secs(2);
/// Default synchronous-wait timeout for `send_to_instance`.
const DEFAULT_WAIT_SECS: u64 = 60;
/// Rough cost estimate per estimated token, used for the cost counter.
const ESTIMATED_COST_PER_TOKEN: f64 = 3.0e-6;

/// Pane substrings that indicate in-flight tool activity.
const TOOL_CALL_MARKERS: &[&str] = &["⏺", "esc to interrupt"];
/// Pane substrings that classify an instance as blocked.
const BLOCKED_SIGNATURES: &[&str] = &[
    "Traceback (most recent call last)",
    "panicked at",
    "command not found",
    "Segmentation fault",
    "FATAL",
];

/// Arguments for spawning one instance. Parent resolution happens before
/// this struct is built; `parent_id == None` is only legal for the root.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub role: Role,
    pub kind: InstanceKind,
    pub model: Option<String>,
    pub parent_id: Option<String>,
    pub team_session_id: Option<String>,
    pub enable_madrox: bool,
}

/// Facade over registry + bus + terminal + artifacts.
pub struct InstanceManager {
    config: Config,
    registry: Arc<InstanceRegistry>,
    bus: Arc<MessageBus>,
    backend: Arc<dyn TerminalBackend>,
    injector: PromptInjector,
}

impl InstanceManager {
    pub fn new(config: Config, backend: Arc<dyn TerminalBackend>) -> Self {
        let injector = PromptInjector::new(backend.clone(), config.paste_threshold);
        Self {
            registry: Arc::new(InstanceRegistry::new(config.max_instances)),
            bus: Arc::new(MessageBus::new()),
            config,
            backend,
            injector,
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve an instance id, calling out correlation ids passed where an
    /// instance id belongs.
    pub fn resolve_instance(&self, id: &str) -> Result<InstanceRecord, ToolError> {
        if !self.registry.contains(id) && self.bus.is_known_correlation(id) {
            return Err(ToolError::invalid_instance_id(format!(
                "'{id}' is a correlation id, not an instance id; pass the instance's own id"
            )));
        }
        self.registry.get(id).map_err(map_registry_err)
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Spawn a new instance: allocate its workspace, start its tmux session,
    /// and wait for the CLI banner (bounded by a grace period).
    pub async fn spawn(&self, req: SpawnRequest) -> Result<InstanceRecord, ToolError> {
        if req.parent_id.is_none() && req.name != madrox_core::instance::ROOT_INSTANCE_NAME {
            return Err(ToolError::parent_required(format!(
                "instance '{}' needs a parent; only '{}' may be parentless",
                req.name,
                madrox_core::instance::ROOT_INSTANCE_NAME
            )));
        }
        if let Some(parent) = &req.parent_id {
            // Validates existence and rejects correlation ids.
            self.resolve_instance(parent)?;
        }

        let mut record = InstanceRecord::new(
            &req.name,
            req.role,
            req.kind,
            PathBuf::new(), // workspace set below once the id is known
        );
        record.model = req.model.clone();
        record.parent_id = req.parent_id.clone();
        record.enable_madrox = req.enable_madrox;
        // Children inherit the parent's team tag unless explicitly re-tagged.
        record.team_session_id = match req.team_session_id {
            Some(team) => Some(team),
            None => req
                .parent_id
                .as_deref()
                .and_then(|pid| self.registry.get(pid).ok())
                .and_then(|p| p.team_session_id),
        };
        record.workspace_path = self.config.workspace_dir.join(&record.id);

        let id = record.id.clone();
        let team = record.team_session_id.clone();
        self.registry.insert(record).map_err(map_registry_err)?;
        self.bus.register_instance(&id);

        if let Err(e) = std::fs::create_dir_all(self.config.workspace_dir.join(&id)) {
            let _ = self.transition(&id, InstanceState::Error);
            return Err(ToolError::io(format!("failed to create workspace: {e}")));
        }

        let session_name = format!("madrox-{}", &id[..8]);
        let command = match &req.model {
            Some(model) => format!("{} --model {model}", req.kind.launch_command()),
            None => req.kind.launch_command().to_string(),
        };
        let mut env = vec![("MADROX_INSTANCE_ID".to_string(), id.clone())];
        if let Some(team) = &team {
            env.push(("MADROX_TEAM_SESSION".to_string(), team.clone()));
        }
        // The child only gets orchestrator access when spawning rights were
        // granted; its own MCP config keys off this variable.
        if req.enable_madrox {
            env.push(("MADROX_ENABLED".to_string(), "1".to_string()));
        }

        let workspace = self.config.workspace_dir.join(&id);
        let handle = match self
            .backend
            .start(&session_name, &command, &env, &workspace)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.transition(&id, InstanceState::Error);
                return Err(map_term_err(e));
            }
        };

        self.registry
            .with_record_mut(&id, |r| r.session_handle = Some(handle.as_str().to_string()))
            .map_err(map_registry_err)?;
        self.transition(&id, InstanceState::Initializing)?;
        self.await_banner(&id, &handle).await;
        self.transition(&id, InstanceState::Ready)?;

        emit(
            AuditEvent::new(AuditEventType::InstanceSpawn, "spawn")
                .instance(&id)
                .team(team)
                .metadata(json!({
                    "name": req.name,
                    "role": req.role.as_str(),
                    "kind": req.kind.as_str(),
                    "parent_id": req.parent_id,
                })),
        );
        info!("spawned {} instance '{}' ({id})", req.kind, req.name);
        self.registry.get(&id).map_err(map_registry_err)
    }

    /// Poll the pane until the CLI banner shows or the grace period elapses.
    async fn await_banner(&self, id: &str, handle: &SessionHandle) {
        let deadline = tokio::time::Instant::now() + READY_GRACE;
        loop {
            match self.backend.capture_pane(handle).await {
                Ok(pane) if !pane.trim().is_empty() => {
                    let hash = content_hash(&pane);
                    let _ = self.registry.with_record_mut(id, |r| {
                        r.last_capture_hash = Some(hash);
                        r.last_capture_change = Some(Utc::now());
                    });
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("banner poll for '{id}' failed: {e}");
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("banner grace elapsed for '{id}', declaring ready");
                return;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Terminate an instance. Idempotent: terminating a terminated instance
    /// succeeds, and a session that is already gone does not fail the call.
    /// The workspace and the registry record are kept for post-mortem
    /// artifact collection.
    pub async fn terminate(&self, id: &str) -> Result<Value, ToolError> {
        let record = self.resolve_instance(id)?;
        if record.state == InstanceState::Terminated {
            return Ok(json!({
                "status": "success",
                "instance_id": id,
                "already_terminated": true,
            }));
        }
        if record.state != InstanceState::Terminating {
            self.transition(id, InstanceState::Terminating)?;
        }

        if let Some(handle) = &record.session_handle {
            if let Err(e) = self.backend.kill(&SessionHandle(handle.clone())).await {
                // Termination still completes; the session may be long gone.
                warn!("kill for '{id}' reported: {e}");
            }
        }

        self.registry
            .with_record_mut(id, |r| r.terminated_at = Some(Utc::now()))
            .map_err(map_registry_err)?;
        self.transition(id, InstanceState::Terminated)?;
        emit(
            AuditEvent::new(AuditEventType::InstanceTerminate, "terminate")
                .instance(id)
                .team(record.team_session_id.clone()),
        );
        Ok(json!({
            "status": "success",
            "instance_id": id,
            "already_terminated": false,
        }))
    }

    /// Apply a state transition and emit the `state_change` audit event.
    fn transition(&self, id: &str, next: InstanceState) -> Result<(), ToolError> {
        let previous = self.registry.transition(id, next).map_err(map_registry_err)?;
        emit(
            AuditEvent::new(AuditEventType::StateChange, "state_change")
                .instance(id)
                .metadata(json!({
                    "from": previous.as_str(),
                    "to": next.as_str(),
                })),
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------

    /// Send a prompt to an instance, optionally waiting for a reply matching
    /// the correlation id. The timeout cancels only the wait; the message
    /// itself still delivers.
    pub async fn send_to_instance(
        &self,
        sender_id: Option<&str>,
        instance_id: &str,
        message: &str,
        wait_for_response: bool,
        timeout_secs: Option<u64>,
        correlation_id: Option<String>,
    ) -> Result<Value, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        if !record.state.is_live() {
            return Err(ToolError::session_gone(format!(
                "instance '{instance_id}' is {}",
                record.state
            )));
        }

        let correlation_id =
            correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.bus
            .record_correlation(record.team_session_id.as_deref(), &correlation_id)
            .map_err(map_bus_err)?;

        let sender = sender_id.unwrap_or("external");
        let envelope = MessageEnvelope::new(
            &correlation_id,
            sender,
            instance_id,
            message,
            MessageKind::Request,
        );
        self.bus.push_inbox(instance_id, envelope).map_err(map_bus_err)?;

        let path = self.deliver(&record, message).await?;
        emit(
            AuditEvent::new(AuditEventType::MessageSent, "send_to_instance")
                .instance(instance_id)
                .team(record.team_session_id.clone())
                .metadata(json!({
                    "sender_id": sender,
                    "correlation_id": correlation_id,
                    "bytes": message.len(),
                    "delivery": delivery_name(path),
                })),
        );

        if wait_for_response {
            let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_WAIT_SECS));
            match self
                .bus
                .wait_for_reply(instance_id, &correlation_id, timeout)
                .await
            {
                Some(reply) => Ok(json!({
                    "status": "success",
                    "instance_id": instance_id,
                    "correlation_id": correlation_id,
                    "reply": serde_json::to_value(&reply)
                        .map_err(|e| ToolError::internal(e.to_string()))?,
                })),
                None => {
                    emit(
                        AuditEvent::new(AuditEventType::Timeout, "wait_for_reply")
                            .instance(instance_id)
                            .metadata(json!({"correlation_id": correlation_id})),
                    );
                    Err(ToolError::timeout(format!(
                        "no reply matching '{correlation_id}' within {}s",
                        timeout.as_secs()
                    )))
                }
            }
        } else {
            Ok(json!({
                "status": "sent",
                "instance_id": instance_id,
                "correlation_id": correlation_id,
                "delivery": delivery_name(path),
            }))
        }
    }

    /// Inject text into an instance's pane, updating state and counters.
    async fn deliver(
        &self,
        record: &InstanceRecord,
        message: &str,
    ) -> Result<InjectionPath, ToolError> {
        let handle = record
            .session_handle
            .clone()
            .map(SessionHandle)
            .ok_or_else(|| {
                ToolError::session_gone(format!("instance '{}' has no session", record.id))
            })?;

        let path = match self.injector.inject(&handle, record.kind, message).await {
            Ok(path) => path,
            Err(e @ TermError::SessionGone { .. }) => {
                let _ = self.transition(&record.id, InstanceState::Error);
                return Err(map_term_err(e));
            }
            Err(e) => return Err(map_term_err(e)),
        };

        let tokens = (message.len() / 4) as u64;
        let _ = self.registry.with_record_mut(&record.id, |r| {
            r.counters.request_count += 1;
            r.counters.tokens_used += tokens;
            r.counters.cost += tokens as f64 * ESTIMATED_COST_PER_TOKEN;
            r.touch();
        });
        // A freshly prompted instance is busy until the pane goes quiet.
        if matches!(record.state, InstanceState::Ready | InstanceState::Idle) {
            let _ = self.transition(&record.id, InstanceState::Busy);
        }
        emit(
            AuditEvent::new(AuditEventType::MessageReceived, "pane_injection")
                .instance(&record.id)
                .metadata(json!({"bytes": message.len()})),
        );
        Ok(path)
    }

    /// Child → parent reply. `instance_id` must be the child's own id; the
    /// reply lands on the child's reply queue (or a parked waiter).
    pub fn reply_to_caller(
        &self,
        instance_id: &str,
        reply_message: &str,
        correlation_id: &str,
    ) -> Result<Value, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        let recipient = record.parent_id.clone().unwrap_or_else(|| "external".to_string());
        let envelope = MessageEnvelope::new(
            correlation_id,
            instance_id,
            &recipient,
            reply_message,
            MessageKind::Reply,
        );
        self.bus
            .deliver_reply(instance_id, envelope)
            .map_err(map_bus_err)?;
        let _ = self.registry.with_record_mut(instance_id, |r| r.touch());
        emit(
            AuditEvent::new(AuditEventType::MessageSent, "reply_to_caller")
                .instance(instance_id)
                .team(record.team_session_id.clone())
                .metadata(json!({
                    "correlation_id": correlation_id,
                    "recipient_id": recipient,
                })),
        );
        Ok(json!({
            "status": "success",
            "instance_id": instance_id,
            "correlation_id": correlation_id,
        }))
    }

    /// Drain an instance's reply queue, order preserved.
    pub fn get_pending_replies(&self, instance_id: &str) -> Result<Value, ToolError> {
        self.resolve_instance(instance_id)?;
        let replies = self
            .bus
            .drain_replies(instance_id)
            .map_err(map_bus_err)?;
        Ok(json!({
            "status": "success",
            "instance_id": instance_id,
            "count": replies.len(),
            "replies": serde_json::to_value(&replies)
                .map_err(|e| ToolError::internal(e.to_string()))?,
        }))
    }

    /// Fan a message out to every live direct child. Partial failure is
    /// reported per recipient; a single bad child never fails the batch.
    pub async fn broadcast_to_children(
        &self,
        parent_id: &str,
        message: &str,
    ) -> Result<Value, ToolError> {
        self.resolve_instance(parent_id)?;
        let children: Vec<_> = self
            .registry
            .children_of(parent_id)
            .into_iter()
            .filter(|c| c.state.is_live())
            .collect();

        let mut results = serde_json::Map::new();
        let mut delivered = 0usize;
        for child in &children {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            let outcome: Result<(), ToolError> = async {
                self.bus
                    .record_correlation(child.team_session_id.as_deref(), &correlation_id)
                    .map_err(map_bus_err)?;
                let envelope = MessageEnvelope::new(
                    &correlation_id,
                    parent_id,
                    &child.id,
                    message,
                    MessageKind::Broadcast,
                );
                self.bus.push_inbox(&child.id, envelope).map_err(map_bus_err)?;
                self.deliver(child, message).await?;
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    results.insert(child.id.clone(), json!("ok"));
                }
                Err(e) => {
                    results.insert(child.id.clone(), json!(e.to_json()));
                }
            }
        }
        emit(
            AuditEvent::new(AuditEventType::MessageSent, "broadcast_to_children")
                .instance(parent_id)
                .metadata(json!({"recipients": children.len(), "delivered": delivered})),
        );
        Ok(json!({
            "status": "success",
            "parent_id": parent_id,
            "recipients": results,
            "count": children.len(),
            "delivered": delivered,
        }))
    }

    /// Deliver the interrupt keystroke. Fire-and-forget: transient adapter
    /// errors are logged, only a missing session surfaces.
    pub async fn interrupt(&self, instance_id: &str) -> Result<Value, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        let handle = record
            .session_handle
            .clone()
            .map(SessionHandle)
            .ok_or_else(|| {
                ToolError::session_gone(format!("instance '{instance_id}' has no session"))
            })?;
        match self.backend.interrupt(&handle).await {
            Ok(()) => {}
            Err(e @ TermError::SessionGone { .. }) => return Err(map_term_err(e)),
            Err(e) => warn!("interrupt for '{instance_id}' reported: {e}"),
        }
        Ok(json!({"status": "success", "instance_id": instance_id}))
    }

    // -----------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------

    /// Registry snapshot of one instance plus queue depths.
    pub fn status(&self, instance_id: &str) -> Result<Value, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        let mut value = serde_json::to_value(&record)
            .map_err(|e| ToolError::internal(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("inbox_len".into(), json!(self.bus.inbox_len(instance_id)));
        }
        Ok(json!({"status": "success", "instance": value}))
    }

    /// Status after a forced pane-quiescence refresh, including a pane tail.
    pub async fn live_status(&self, instance_id: &str) -> Result<Value, ToolError> {
        self.refresh_activity(instance_id).await?;
        let mut status = self.status(instance_id)?;
        let record = self.resolve_instance(instance_id)?;
        if let Some(handle) = record.session_handle.clone().map(SessionHandle) {
            if let Ok(pane) = self.backend.capture_pane(&handle).await {
                let tail: String = pane
                    .lines()
                    .rev()
                    .take(20)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                if let Some(obj) = status.as_object_mut() {
                    obj.insert("pane_tail".into(), json!(tail));
                }
            }
        }
        Ok(status)
    }

    /// All instances, as a flat snapshot array.
    pub fn status_all(&self) -> Result<Value, ToolError> {
        let records = self.registry.snapshot();
        let values: Vec<Value> = records
            .iter()
            .map(|r| {
                let mut v = serde_json::to_value(r).unwrap_or(Value::Null);
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("inbox_len".into(), json!(self.bus.inbox_len(&r.id)));
                }
                v
            })
            .collect();
        Ok(json!({"status": "success", "count": values.len(), "instances": values}))
    }

    /// The parent/child forest, roots first.
    pub fn instance_tree(&self) -> Value {
        let records = self.registry.snapshot();
        let mut by_parent: HashMap<Option<String>, Vec<&InstanceRecord>> = HashMap::new();
        for record in &records {
            by_parent
                .entry(record.parent_id.clone())
                .or_default()
                .push(record);
        }

        fn node(
            record: &InstanceRecord,
            by_parent: &HashMap<Option<String>, Vec<&InstanceRecord>>,
        ) -> Value {
            let children: Vec<Value> = by_parent
                .get(&Some(record.id.clone()))
                .map(|kids| kids.iter().map(|k| node(k, by_parent)).collect())
                .unwrap_or_default();
            json!({
                "instance_id": record.id,
                "name": record.name,
                "role": record.role.as_str(),
                "kind": record.kind.as_str(),
                "state": record.state.as_str(),
                "team_session_id": record.team_session_id,
                "children": children,
            })
        }

        let roots: Vec<Value> = by_parent
            .get(&None)
            .map(|roots| roots.iter().map(|r| node(r, &by_parent)).collect())
            .unwrap_or_default();
        json!({"status": "success", "tree": roots})
    }

    /// Raw pane capture for one instance.
    pub async fn capture(&self, instance_id: &str) -> Result<String, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        let handle = record
            .session_handle
            .clone()
            .map(SessionHandle)
            .ok_or_else(|| {
                ToolError::session_gone(format!("instance '{instance_id}' has no session"))
            })?;
        self.backend.capture_pane(&handle).await.map_err(map_term_err)
    }

    /// Refresh busy/idle from pane quiescence and catch dead sessions.
    ///
    /// Pane unchanged for the quiescence window moves `busy → idle`; fresh
    /// tool markers move `ready/idle → busy`; a gone session moves the
    /// instance to `error`.
    pub async fn refresh_activity(&self, instance_id: &str) -> Result<(), ToolError> {
        let record = self.resolve_instance(instance_id)?;
        if !record.state.is_live() {
            return Ok(());
        }
        let Some(handle) = record.session_handle.clone().map(SessionHandle) else {
            return Ok(());
        };

        let pane = match self.backend.capture_pane(&handle).await {
            Ok(pane) => pane,
            Err(TermError::SessionGone { .. }) => {
                if record.state.can_transition_to(InstanceState::Error) {
                    let _ = self.transition(instance_id, InstanceState::Error);
                    emit(
                        AuditEvent::new(AuditEventType::Error, "session_gone")
                            .instance(instance_id),
                    );
                }
                return Ok(());
            }
            Err(e) => {
                debug!("activity refresh capture failed for '{instance_id}': {e}");
                return Ok(());
            }
        };

        let hash = content_hash(&pane);
        let marker_count = TOOL_CALL_MARKERS
            .iter()
            .map(|m| pane.matches(m).count() as u64)
            .sum::<u64>();

        let (changed, quiesced, saw_new_tools) = self
            .registry
            .with_record_mut(instance_id, |r| {
                let changed = r.last_capture_hash != Some(hash);
                let now = Utc::now();
                if changed {
                    r.last_capture_hash = Some(hash);
                    r.last_capture_change = Some(now);
                    r.last_activity = now;
                }
                let saw_new_tools = marker_count > r.counters.tools_executed;
                if saw_new_tools {
                    r.counters.tools_executed = marker_count;
                }
                let quiesced = !changed
                    && r.last_capture_change
                        .map(|t| {
                            now.signed_duration_since(t).num_milliseconds().max(0) as u128
                                >= QUIESCENCE_WINDOW.as_millis()
                        })
                        .unwrap_or(false);
                (changed, quiesced, saw_new_tools)
            })
            .map_err(map_registry_err)?;

        match record.state {
            InstanceState::Busy if quiesced => {
                let _ = self.transition(instance_id, InstanceState::Idle);
            }
            InstanceState::Ready | InstanceState::Idle if changed && saw_new_tools => {
                let _ = self.transition(instance_id, InstanceState::Busy);
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether an instance's pane currently shows a known blocked signature.
    pub async fn looks_blocked(&self, instance_id: &str) -> bool {
        match self.capture(instance_id).await {
            Ok(pane) => BLOCKED_SIGNATURES.iter().any(|sig| pane.contains(sig)),
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------
    // Workspace browse
    // -----------------------------------------------------------------

    /// Relative paths of the files in an instance's workspace.
    pub fn list_files(&self, instance_id: &str, subdir: Option<&str>) -> Result<Value, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        let base = match subdir {
            Some(sub) => guarded_join(&record.workspace_path, sub)?,
            None => record.workspace_path.clone(),
        };
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.map_err(|e| ToolError::io(e.to_string()))?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&record.workspace_path) {
                    files.push(rel.to_string_lossy().into_owned());
                }
            }
        }
        Ok(json!({
            "status": "success",
            "instance_id": instance_id,
            "count": files.len(),
            "files": files,
        }))
    }

    /// Read one file from an instance's workspace.
    pub fn retrieve_file(&self, instance_id: &str, rel_path: &str) -> Result<Value, ToolError> {
        let record = self.resolve_instance(instance_id)?;
        let path = guarded_join(&record.workspace_path, rel_path)?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ToolError::io(format!("cannot read '{rel_path}': {e}")))?;
        Ok(json!({
            "status": "success",
            "instance_id": instance_id,
            "path": rel_path,
            "content": content,
        }))
    }

    // -----------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------

    /// Snapshot a team's workspaces, transcripts, and metadata into a fresh
    /// timestamped artifact directory.
    pub async fn collect_team_artifacts(&self, team_session_id: &str) -> Result<Value, ToolError> {
        if team_session_id.trim().is_empty() {
            return Err(ToolError::new(
                ToolErrorKind::EmptyTeamId,
                "team_session_id must not be empty",
            ));
        }
        let members = self.registry.team_members(team_session_id);
        if members.is_empty() {
            return Err(ToolError::new(
                ToolErrorKind::NoMembers,
                format!("no instances tagged with team '{team_session_id}'"),
            ));
        }

        // Best-effort transcript snapshot per member; a dead session simply
        // yields no output.log.
        let mut captures = HashMap::new();
        for member in &members {
            if let Some(handle) = member.session_handle.clone().map(SessionHandle) {
                if let Ok(pane) = self.backend.capture_pane(&handle).await {
                    captures.insert(member.id.clone(), pane);
                }
            }
        }

        let collector = ArtifactCollector::new(&self.config);
        collector.collect(team_session_id, &members, &captures)
    }
}

/// Join `rel` under `base`, rejecting traversal outside the workspace.
fn guarded_join(base: &Path, rel: &str) -> Result<PathBuf, ToolError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ToolError::io(format!(
            "path '{rel}' escapes the instance workspace"
        )));
    }
    Ok(base.join(rel_path))
}

fn content_hash(s: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn delivery_name(path: InjectionPath) -> &'static str {
    match path {
        InjectionPath::Keystrokes => "keystrokes",
        InjectionPath::PasteBuffer => "paste_buffer",
        InjectionPath::PasteFallback => "paste_fallback",
    }
}

fn map_registry_err(err: RegistryError) -> ToolError {
    match err {
        RegistryError::UnknownInstance(id) => {
            ToolError::invalid_instance_id(format!("instance '{id}' not found"))
        }
        RegistryError::UnknownParent(id) => {
            ToolError::invalid_instance_id(format!("parent instance '{id}' not found"))
        }
        RegistryError::DuplicateRoot(id) => ToolError::parent_required(format!(
            "a root instance already exists ({id}); provide parent_instance_id"
        )),
        RegistryError::MaxInstances(n) => {
            ToolError::internal(format!("instance cap reached ({n} live)"))
        }
        RegistryError::InvalidTransition { from, to } => {
            ToolError::internal(format!("invalid state transition {from} -> {to}"))
        }
    }
}

fn map_bus_err(err: BusError) -> ToolError {
    match err {
        BusError::CorrelationReused(id) => ToolError::internal(format!(
            "correlation id '{id}' already used in this team session"
        )),
        BusError::UnknownInstance(id) => {
            ToolError::invalid_instance_id(format!("instance '{id}' not found"))
        }
    }
}

fn map_term_err(err: TermError) -> ToolError {
    match err {
        TermError::SessionGone { session, message } => {
            ToolError::session_gone(format!("session '{session}': {message}"))
        }
        TermError::Unavailable { message } => ToolError::internal(message),
        TermError::Transient { message, .. } => ToolError::internal(message),
    }
}
