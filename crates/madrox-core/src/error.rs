//! Tool-facing error taxonomy.
//!
//! Every error surfaced to an MCP caller is one of the kinds below, wired to
//! a stable string so clients can match without parsing prose. The JSON shape
//! is `{status:"error", error:<kind>, message:<human>}`.

use serde_json::{Value, json};

/// Stable error kinds for tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// Parent auto-detection failed and the instance is not the root.
    ParentRequired,
    /// Id absent from the registry, or a correlation id used as an instance id.
    InvalidInstanceId,
    /// A deprecated tool was invoked.
    Deprecated,
    /// Artifact collection called with an empty team id.
    EmptyTeamId,
    /// Artifact collection found no members for the team.
    NoMembers,
    /// The terminal adapter cannot reach the pane.
    SessionGone,
    /// A synchronous wait elapsed without a matching reply.
    Timeout,
    /// Bounded queue hit its cap. Logged, not normally surfaced to callers.
    QueueOverflow,
    /// Filesystem error during artifact work.
    Io,
    /// Anything uncaught.
    Internal,
}

impl ToolErrorKind {
    /// The wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParentRequired => "PARENT_REQUIRED",
            Self::InvalidInstanceId => "INVALID_INSTANCE_ID",
            Self::Deprecated => "DEPRECATED",
            Self::EmptyTeamId => "EMPTY_TEAM_ID",
            Self::NoMembers => "NO_MEMBERS",
            Self::SessionGone => "SESSION_GONE",
            Self::Timeout => "TIMEOUT",
            Self::QueueOverflow => "QUEUE_OVERFLOW",
            Self::Io => "IO",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool error: a kind plus a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parent_required(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ParentRequired, message)
    }

    pub fn invalid_instance_id(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidInstanceId, message)
    }

    pub fn session_gone(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::SessionGone, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Internal, message)
    }

    /// The wire shape surfaced to tool callers.
    pub fn to_json(&self) -> Value {
        json!({
            "status": "error",
            "error": self.kind.as_str(),
            "message": self.message,
        })
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ToolErrorKind::Io, err.to_string())
    }
}
