//! Tool dispatch: one pure entry point shared by both transports.
//!
//! [`handle_rpc`] frames JSON-RPC; [`dispatch`] routes a `(tool_name, args,
//! caller_context)` triple to its handler and wraps the outcome as an MCP
//! tool result with a single text content item. Transports own no state, so
//! identical arguments produce byte-identical responses on stdio and HTTP.

use crate::caller::{detect_caller, CallerContext};
use crate::tools::tool_definitions;
use madrox_core::instance::ROOT_INSTANCE_NAME;
use madrox_core::{InstanceKind, Role, ToolError, ToolErrorKind};
use madrox_orchestrator::{InstanceManager, SpawnRequest};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// JSON-RPC error code: method not found.
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code: invalid request.
pub const ERR_INVALID_REQUEST: i64 = -32600;

/// MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Handle one JSON-RPC request or notification. Returns `None` for
/// notifications (no `id`), which produce no response on the wire.
pub async fn handle_rpc(manager: &Arc<InstanceManager>, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    // Notifications carry no id and get no response.
    let id = match id {
        Some(id) if !id.is_null() => id,
        _ => {
            debug!("notification '{method}' acknowledged silently");
            return None;
        }
    };

    let result = match method {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {
                "name": "madrox",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
        "tools/list" => json!({"tools": tool_definitions()}),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            let caller = CallerContext {
                instance_id: detect_caller(manager.registry()),
            };
            dispatch(manager, name, &args, &caller).await
        }
        "ping" => json!({}),
        other => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": ERR_METHOD_NOT_FOUND, "message": format!("unknown method '{other}'")},
            }));
        }
    };

    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

/// Route one tool call. Always returns an MCP tool result; failures are
/// `isError: true` with the structured error JSON as the text payload.
pub async fn dispatch(
    manager: &Arc<InstanceManager>,
    name: &str,
    args: &Value,
    caller: &CallerContext,
) -> Value {
    let outcome = match name {
        "spawn_claude" => handle_spawn(manager, args, caller, InstanceKind::Claude).await,
        "spawn_codex" => handle_spawn(manager, args, caller, InstanceKind::Codex).await,
        "spawn_multiple_instances" => handle_spawn_multiple(manager, args, caller).await,
        "send_to_instance" => handle_send(manager, args, caller).await,
        "reply_to_caller" => handle_reply(manager, args, caller),
        "get_pending_replies" => {
            require_str(args, "instance_id").and_then(|id| manager.get_pending_replies(id))
        }
        "broadcast_to_children" => handle_broadcast(manager, args).await,
        "coordinate_instances" => handle_coordinate(manager, args, caller).await,
        "get_instance_status" => match args.get("instance_id").and_then(Value::as_str) {
            Some(id) => manager.status(id),
            None => manager.status_all(),
        },
        "get_live_instance_status" => match require_str(args, "instance_id") {
            Ok(id) => manager.live_status(id).await,
            Err(e) => Err(e),
        },
        "get_instance_tree" => Ok(manager.instance_tree()),
        "get_tmux_pane_content" => match require_str(args, "instance_id") {
            Ok(id) => manager.capture(id).await.map(|pane| {
                json!({"status": "success", "instance_id": id, "content": pane})
            }),
            Err(e) => Err(e),
        },
        "interrupt_instance" => match require_str(args, "instance_id") {
            Ok(id) => manager.interrupt(id).await,
            Err(e) => Err(e),
        },
        "terminate_instance" => match require_str(args, "instance_id") {
            Ok(id) => manager.terminate(id).await,
            Err(e) => Err(e),
        },
        "list_instance_files" => require_str(args, "instance_id").and_then(|id| {
            manager.list_files(id, args.get("path").and_then(Value::as_str))
        }),
        "retrieve_instance_file" => require_str(args, "instance_id").and_then(|id| {
            require_str(args, "path").and_then(|path| manager.retrieve_file(id, path))
        }),
        "collect_team_artifacts" => handle_collect(manager, args).await,
        "get_main_instance_id" => Err(ToolError::new(
            ToolErrorKind::Deprecated,
            "get_main_instance_id is deprecated: use your own instance id from your spawn \
             context; the orchestrator never substitutes the root",
        )),
        other => Err(ToolError::internal(format!("unknown tool '{other}'"))),
    };

    match outcome {
        Ok(payload) => tool_result(&payload, false),
        Err(err) => tool_result(&err.to_json(), true),
    }
}

fn tool_result(payload: &Value, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": payload.to_string()}],
        "isError": is_error,
    })
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::internal(format!("missing required argument '{key}'")))
}

/// Team ids are non-empty and limited to `[A-Za-z0-9_-]` so they embed
/// safely in artifact directory names.
fn validate_team_id(team: &str) -> Result<(), ToolError> {
    if team.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::EmptyTeamId,
            "team_session_id must not be empty",
        ));
    }
    if !team
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ToolError::new(
            ToolErrorKind::EmptyTeamId,
            format!("team id '{team}' must match [A-Za-z0-9_-]+"),
        ));
    }
    Ok(())
}

fn parse_role(args: &Value) -> Result<Role, ToolError> {
    match args.get("role").and_then(Value::as_str) {
        None => Ok(Role::General),
        Some(raw) => Role::parse(raw).ok_or_else(|| {
            ToolError::internal(format!("unknown role '{raw}'; see the tool schema for the fixed set"))
        }),
    }
}

/// Parent auto-detection for spawn calls:
/// explicit `parent_instance_id` → transport caller evidence → the
/// root-name exception → `PARENT_REQUIRED`. The root is never substituted.
fn resolve_parent(
    args: &Value,
    caller: &CallerContext,
    instance_name: &str,
) -> Result<Option<String>, ToolError> {
    if let Some(explicit) = args.get("parent_instance_id").and_then(Value::as_str) {
        if !explicit.is_empty() {
            return Ok(Some(explicit.to_string()));
        }
    }
    if let Some(detected) = &caller.instance_id {
        return Ok(Some(detected.clone()));
    }
    if instance_name == ROOT_INSTANCE_NAME {
        return Ok(None);
    }
    Err(ToolError::parent_required(format!(
        "cannot determine a parent for '{instance_name}': pass parent_instance_id explicitly \
         (no managed instance is currently executing a tool call)"
    )))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn spawn_request_from(
    args: &Value,
    caller: &CallerContext,
    kind: InstanceKind,
) -> Result<SpawnRequest, ToolError> {
    let name = require_str(args, "name")?;
    let role = parse_role(args)?;
    if let Some(team) = args.get("team_session_id").and_then(Value::as_str) {
        validate_team_id(team)?;
    }
    Ok(SpawnRequest {
        name: name.to_string(),
        role,
        kind,
        model: args
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
        parent_id: resolve_parent(args, caller, name)?,
        team_session_id: args
            .get("team_session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        enable_madrox: args
            .get("enable_madrox")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

async fn handle_spawn(
    manager: &Arc<InstanceManager>,
    args: &Value,
    caller: &CallerContext,
    kind: InstanceKind,
) -> Result<Value, ToolError> {
    let req = spawn_request_from(args, caller, kind)?;
    let record = manager.spawn(req).await?;
    Ok(json!({
        "status": "success",
        "instance_id": record.id,
        "name": record.name,
        "role": record.role.as_str(),
        "kind": record.kind.as_str(),
        "state": record.state.as_str(),
        "parent_id": record.parent_id,
        "team_session_id": record.team_session_id,
        "workspace_path": record.workspace_path,
    }))
}

/// Batch spawn. Each item resolves its own parent (the caller is injected
/// where an item omits one); a failed item never aborts the batch.
async fn handle_spawn_multiple(
    manager: &Arc<InstanceManager>,
    args: &Value,
    caller: &CallerContext,
) -> Result<Value, ToolError> {
    let items = args
        .get("instances")
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::internal("missing required argument 'instances'"))?;
    let batch_team = args
        .get("team_session_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(team) = &batch_team {
        validate_team_id(team)?;
    }

    let mut results = Vec::with_capacity(items.len());
    let mut spawned = 0usize;
    for item in items {
        let kind = match item.get("kind").and_then(Value::as_str) {
            None | Some("claude") => InstanceKind::Claude,
            Some("codex") => InstanceKind::Codex,
            Some(other) => {
                results.push(json!({
                    "status": "error",
                    "error": "INTERNAL",
                    "message": format!("unknown kind '{other}'"),
                }));
                continue;
            }
        };
        let mut item_args = item.clone();
        if item_args.get("team_session_id").is_none() {
            if let (Some(obj), Some(team)) = (item_args.as_object_mut(), &batch_team) {
                obj.insert("team_session_id".into(), json!(team));
            }
        }
        match spawn_request_from(&item_args, caller, kind) {
            Ok(req) => match manager.spawn(req).await {
                Ok(record) => {
                    spawned += 1;
                    results.push(json!({
                        "status": "success",
                        "instance_id": record.id,
                        "name": record.name,
                    }));
                }
                Err(e) => results.push(e.to_json()),
            },
            Err(e) => results.push(e.to_json()),
        }
    }
    Ok(json!({
        "status": "success",
        "requested": items.len(),
        "spawned": spawned,
        "results": results,
    }))
}

async fn handle_send(
    manager: &Arc<InstanceManager>,
    args: &Value,
    caller: &CallerContext,
) -> Result<Value, ToolError> {
    let instance_id = require_str(args, "instance_id")?;
    let message = require_str(args, "message")?;
    manager
        .send_to_instance(
            caller.instance_id.as_deref(),
            instance_id,
            message,
            args.get("wait_for_response")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            args.get("timeout").and_then(Value::as_u64),
            args.get("correlation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        )
        .await
}

fn handle_reply(
    manager: &Arc<InstanceManager>,
    args: &Value,
    caller: &CallerContext,
) -> Result<Value, ToolError> {
    let instance_id = require_str(args, "instance_id")?;
    let message = require_str(args, "message")?;
    let correlation_id = require_str(args, "correlation_id")?;
    // A child may only reply as itself. When transport evidence identifies
    // the caller, a mismatched id is rejected outright.
    if let Some(detected) = &caller.instance_id {
        if detected != instance_id && manager.registry().contains(instance_id) {
            return Err(ToolError::invalid_instance_id(format!(
                "reply_to_caller requires your own instance id ('{detected}'), got '{instance_id}'"
            )));
        }
    }
    manager.reply_to_caller(instance_id, message, correlation_id)
}

async fn handle_broadcast(
    manager: &Arc<InstanceManager>,
    args: &Value,
) -> Result<Value, ToolError> {
    let parent_id = require_str(args, "parent_instance_id")?;
    let message = require_str(args, "message")?;
    manager.broadcast_to_children(parent_id, message).await
}

async fn handle_collect(
    manager: &Arc<InstanceManager>,
    args: &Value,
) -> Result<Value, ToolError> {
    let team = args
        .get("team_session_id")
        .and_then(Value::as_str)
        .unwrap_or("");
    validate_team_id(team)?;
    manager.collect_team_artifacts(team).await
}

/// Scripted coordination: run each step's send, sequentially or in
/// parallel. Per-step failures are reported in place; the batch always
/// completes.
async fn handle_coordinate(
    manager: &Arc<InstanceManager>,
    args: &Value,
    caller: &CallerContext,
) -> Result<Value, ToolError> {
    let steps = args
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::internal("missing required argument 'steps'"))?
        .clone();
    let mode = args
        .get("mode")
        .and_then(Value::as_str)
        .unwrap_or("sequential");
    if !matches!(mode, "sequential" | "parallel") {
        return Err(ToolError::internal(format!(
            "unknown coordination mode '{mode}' (expected 'sequential' or 'parallel')"
        )));
    }

    let sender = caller.instance_id.clone();
    let run_step = |step: Value, sender: Option<String>, manager: Arc<InstanceManager>| async move {
        let instance_id = match step.get("instance_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                return json!({"status": "error", "error": "INTERNAL",
                              "message": "step missing 'instance_id'"})
            }
        };
        let message = match step.get("message").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => {
                return json!({"status": "error", "error": "INTERNAL",
                              "message": "step missing 'message'", "instance_id": instance_id})
            }
        };
        let outcome = manager
            .send_to_instance(
                sender.as_deref(),
                &instance_id,
                &message,
                step.get("wait_for_response")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                step.get("timeout").and_then(Value::as_u64),
                None,
            )
            .await;
        match outcome {
            Ok(v) => v,
            Err(e) => {
                let mut v = e.to_json();
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("instance_id".into(), json!(instance_id));
                }
                v
            }
        }
    };

    let results: Vec<Value> = if mode == "parallel" {
        let mut set = tokio::task::JoinSet::new();
        for (idx, step) in steps.into_iter().enumerate() {
            let manager = manager.clone();
            let sender = sender.clone();
            set.spawn(async move { (idx, run_step(step, sender, manager).await) });
        }
        let mut indexed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => indexed.push(pair),
                Err(e) => indexed.push((
                    usize::MAX,
                    json!({"status": "error", "error": "INTERNAL", "message": e.to_string()}),
                )),
            }
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, v)| v).collect()
    } else {
        let mut out = Vec::with_capacity(steps.len());
        for step in steps {
            out.push(run_step(step, sender.clone(), manager.clone()).await);
        }
        out
    };

    let failed = results
        .iter()
        .filter(|r| r.get("status").and_then(Value::as_str) == Some("error"))
        .count();
    Ok(json!({
        "status": "success",
        "mode": mode,
        "steps": results.len(),
        "failed": failed,
        "results": results,
    }))
}
