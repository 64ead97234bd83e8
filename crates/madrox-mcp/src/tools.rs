//! MCP tool definitions for the madrox orchestrator.
//!
//! These schemas are returned from `tools/list` on both transports. Names
//! are wire-stable: clients match on them, so renames are breaking changes.

use serde_json::{json, Value};

/// Number of tools the orchestrator exposes.
pub const TOOL_COUNT: usize = 18;

/// Return all tool definitions as JSON values.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        spawn_claude_schema(),
        spawn_codex_schema(),
        spawn_multiple_instances_schema(),
        send_to_instance_schema(),
        reply_to_caller_schema(),
        get_pending_replies_schema(),
        broadcast_to_children_schema(),
        coordinate_instances_schema(),
        get_instance_status_schema(),
        get_live_instance_status_schema(),
        get_instance_tree_schema(),
        get_tmux_pane_content_schema(),
        interrupt_instance_schema(),
        terminate_instance_schema(),
        list_instance_files_schema(),
        retrieve_instance_file_schema(),
        collect_team_artifacts_schema(),
        get_main_instance_id_schema(),
    ]
}

fn spawn_properties() -> Value {
    json!({
        "name": {"type": "string", "description": "Human label for the instance (not unique)"},
        "role": {"type": "string", "description": "Role tag, e.g. general, architect, qa_engineer"},
        "model": {"type": "string", "description": "Optional model override passed to the CLI"},
        "parent_instance_id": {"type": "string", "description": "Parent instance id; auto-detected from the caller when omitted"},
        "team_session_id": {"type": "string", "description": "Team tag for artifact collection; inherited from the parent when omitted"},
        "enable_madrox": {"type": "boolean", "description": "Grant the child permission to spawn its own children (default: false)"}
    })
}

fn spawn_claude_schema() -> Value {
    json!({
        "name": "spawn_claude",
        "description": "Spawn a new claude instance in its own tmux session",
        "inputSchema": {
            "type": "object",
            "properties": spawn_properties(),
            "required": ["name"]
        }
    })
}

fn spawn_codex_schema() -> Value {
    json!({
        "name": "spawn_codex",
        "description": "Spawn a new codex instance in its own tmux session",
        "inputSchema": {
            "type": "object",
            "properties": spawn_properties(),
            "required": ["name"]
        }
    })
}

fn spawn_multiple_instances_schema() -> Value {
    json!({
        "name": "spawn_multiple_instances",
        "description": "Spawn a batch of instances; the caller is injected as parent for each item that omits one",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instances": {
                    "type": "array",
                    "description": "Per-instance spawn arguments (same fields as spawn_claude, plus 'kind')",
                    "items": {
                        "type": "object",
                        "properties": spawn_properties(),
                        "required": ["name"]
                    }
                },
                "team_session_id": {"type": "string", "description": "Team tag applied to every item that omits one"}
            },
            "required": ["instances"]
        }
    })
}

fn send_to_instance_schema() -> Value {
    json!({
        "name": "send_to_instance",
        "description": "Send a prompt to an instance, optionally waiting for a correlated reply",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Target instance id"},
                "message": {"type": "string", "description": "Prompt text to inject"},
                "wait_for_response": {"type": "boolean", "description": "Block until a matching reply arrives (default: false)"},
                "timeout": {"type": "integer", "description": "Wait timeout in seconds (default: 60)"},
                "correlation_id": {"type": "string", "description": "Sender-chosen correlation id; generated when omitted"}
            },
            "required": ["instance_id", "message"]
        }
    })
}

fn reply_to_caller_schema() -> Value {
    json!({
        "name": "reply_to_caller",
        "description": "Reply to the parent that messaged you. instance_id must be YOUR OWN instance id, never a correlation id",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Your own instance id"},
                "message": {"type": "string", "description": "Reply text"},
                "correlation_id": {"type": "string", "description": "Correlation id echoed from the request you are answering"}
            },
            "required": ["instance_id", "message", "correlation_id"]
        }
    })
}

fn get_pending_replies_schema() -> Value {
    json!({
        "name": "get_pending_replies",
        "description": "Drain the reply queue of a child instance (order preserved)",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Child instance id whose replies to collect"}
            },
            "required": ["instance_id"]
        }
    })
}

fn broadcast_to_children_schema() -> Value {
    json!({
        "name": "broadcast_to_children",
        "description": "Send one message to every live direct child; reports per-recipient success",
        "inputSchema": {
            "type": "object",
            "properties": {
                "parent_instance_id": {"type": "string", "description": "Parent whose children receive the message"},
                "message": {"type": "string", "description": "Message text"}
            },
            "required": ["parent_instance_id", "message"]
        }
    })
}

fn coordinate_instances_schema() -> Value {
    json!({
        "name": "coordinate_instances",
        "description": "Run a scripted multi-step coordination across instances, sequentially or in parallel",
        "inputSchema": {
            "type": "object",
            "properties": {
                "mode": {"type": "string", "description": "'sequential' or 'parallel' (default: sequential)"},
                "steps": {
                    "type": "array",
                    "description": "Coordination steps",
                    "items": {
                        "type": "object",
                        "properties": {
                            "instance_id": {"type": "string", "description": "Target instance"},
                            "message": {"type": "string", "description": "Prompt for this step"},
                            "wait_for_response": {"type": "boolean", "description": "Wait for a correlated reply"},
                            "timeout": {"type": "integer", "description": "Per-step wait timeout in seconds"}
                        },
                        "required": ["instance_id", "message"]
                    }
                }
            },
            "required": ["steps"]
        }
    })
}

fn get_instance_status_schema() -> Value {
    json!({
        "name": "get_instance_status",
        "description": "Snapshot of one instance, or of all instances when instance_id is omitted",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id; omit for all instances"}
            }
        }
    })
}

fn get_live_instance_status_schema() -> Value {
    json!({
        "name": "get_live_instance_status",
        "description": "Instance status after a forced pane-activity refresh, including a pane tail",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id"}
            },
            "required": ["instance_id"]
        }
    })
}

fn get_instance_tree_schema() -> Value {
    json!({
        "name": "get_instance_tree",
        "description": "The parent/child forest of all managed instances",
        "inputSchema": {
            "type": "object",
            "properties": {}
        }
    })
}

fn get_tmux_pane_content_schema() -> Value {
    json!({
        "name": "get_tmux_pane_content",
        "description": "Raw pane capture (visible text plus bounded scrollback) for an instance",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id"}
            },
            "required": ["instance_id"]
        }
    })
}

fn interrupt_instance_schema() -> Value {
    json!({
        "name": "interrupt_instance",
        "description": "Deliver the interrupt keystroke (Ctrl-C) to an instance's pane",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id"}
            },
            "required": ["instance_id"]
        }
    })
}

fn terminate_instance_schema() -> Value {
    json!({
        "name": "terminate_instance",
        "description": "Terminate an instance and free its tmux session. Idempotent; the workspace is kept",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id"}
            },
            "required": ["instance_id"]
        }
    })
}

fn list_instance_files_schema() -> Value {
    json!({
        "name": "list_instance_files",
        "description": "List the files in an instance's workspace",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id"},
                "path": {"type": "string", "description": "Subdirectory to list, relative to the workspace root"}
            },
            "required": ["instance_id"]
        }
    })
}

fn retrieve_instance_file_schema() -> Value {
    json!({
        "name": "retrieve_instance_file",
        "description": "Read one file from an instance's workspace",
        "inputSchema": {
            "type": "object",
            "properties": {
                "instance_id": {"type": "string", "description": "Instance id"},
                "path": {"type": "string", "description": "File path relative to the workspace root"}
            },
            "required": ["instance_id", "path"]
        }
    })
}

fn collect_team_artifacts_schema() -> Value {
    json!({
        "name": "collect_team_artifacts",
        "description": "Archive a team session: workspaces, transcripts, and metadata into a timestamped directory",
        "inputSchema": {
            "type": "object",
            "properties": {
                "team_session_id": {"type": "string", "description": "Team tag whose members to archive"}
            },
            "required": ["team_session_id"]
        }
    })
}

fn get_main_instance_id_schema() -> Value {
    json!({
        "name": "get_main_instance_id",
        "description": "DEPRECATED: always returns an error. Use your own instance id instead",
        "inputSchema": {
            "type": "object",
            "properties": {}
        }
    })
}
