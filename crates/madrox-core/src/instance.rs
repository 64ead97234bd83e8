//! Instance schema: identity, roles, kinds, and the lifecycle state machine.
//!
//! ## State machine
//!
//! ```text
//! spawning → initializing → ready → busy ⇄ idle → terminating → terminated
//!                                     (error reachable from any live state)
//! ```
//!
//! Transitions move monotonically towards `terminated`; the registry rejects
//! anything [`InstanceState::can_transition_to`] does not allow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name reserved for the single root instance allowed to have no parent.
pub const ROOT_INSTANCE_NAME: &str = "main-orchestrator";

/// Which AI CLI an instance runs. Selects the launch command and the
/// soft-newline key used for multi-line keystroke injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Claude,
    Codex,
}

impl InstanceKind {
    /// The executable launched inside the instance's tmux session.
    pub fn launch_command(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// tmux key name inserting a newline without submitting the prompt.
    ///
    /// Both CLIs treat C-j as a literal newline in their input box, so the
    /// keystroke path can stream multi-line text without firing the prompt.
    pub fn soft_newline_key(self) -> &'static str {
        match self {
            Self::Claude => "C-j",
            Self::Codex => "C-j",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed role vocabulary for spawned instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    General,
    Architect,
    FrontendDeveloper,
    BackendDeveloper,
    DataScientist,
    DevopsEngineer,
    Designer,
    QaEngineer,
    SecurityAnalyst,
    TechnicalWriter,
    ProjectManager,
}

impl Role {
    /// Parse a role from its wire string. Unknown strings are rejected so
    /// callers get a validation error instead of a silent default.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(Self::General),
            "architect" => Some(Self::Architect),
            "frontend_developer" => Some(Self::FrontendDeveloper),
            "backend_developer" => Some(Self::BackendDeveloper),
            "data_scientist" => Some(Self::DataScientist),
            "devops_engineer" => Some(Self::DevopsEngineer),
            "designer" => Some(Self::Designer),
            "qa_engineer" => Some(Self::QaEngineer),
            "security_analyst" => Some(Self::SecurityAnalyst),
            "technical_writer" => Some(Self::TechnicalWriter),
            "project_manager" => Some(Self::ProjectManager),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Architect => "architect",
            Self::FrontendDeveloper => "frontend_developer",
            Self::BackendDeveloper => "backend_developer",
            Self::DataScientist => "data_scientist",
            Self::DevopsEngineer => "devops_engineer",
            Self::Designer => "designer",
            Self::QaEngineer => "qa_engineer",
            Self::SecurityAnalyst => "security_analyst",
            Self::TechnicalWriter => "technical_writer",
            Self::ProjectManager => "project_manager",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed instance.
///
/// | State | Meaning |
/// |-------|---------|
/// | `Spawning` | Record created, session not yet started |
/// | `Initializing` | Session started, waiting for the CLI banner |
/// | `Ready` | Banner observed (or grace elapsed), no prompt injected yet |
/// | `Busy` | A prompt was injected or tool activity is visible in the pane |
/// | `Idle` | Pane quiescent for the quiescence window |
/// | `Error` | Session gone or an uncaught failure during handling |
/// | `Terminating` | Explicit termination in progress |
/// | `Terminated` | All resources released |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Spawning,
    Initializing,
    Ready,
    Busy,
    Idle,
    Error,
    Terminating,
    Terminated,
}

impl InstanceState {
    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// `Error` is reachable from any live state; nothing leaves `Terminated`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use InstanceState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Terminated, _) => false,
            (Terminating, Terminated) => true,
            (Terminating, _) => false,
            (_, Terminating) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Spawning, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Busy) | (Idle, Busy) => true,
            (Busy, Idle) => true,
            _ => false,
        }
    }

    /// Not yet terminating or terminated.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Terminating | Self::Terminated)
    }

    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage counters maintained by the manager and supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCounters {
    pub request_count: u64,
    /// Estimated from injected and captured character volume.
    pub tokens_used: u64,
    pub cost: f64,
    pub tools_executed: u64,
}

/// The authoritative record for one managed instance.
///
/// Message queues live on the bus, not here; the record is cheap to clone so
/// reads can snapshot without holding the registry lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub kind: InstanceKind,
    pub model: Option<String>,
    pub parent_id: Option<String>,
    pub team_session_id: Option<String>,
    /// Opaque multiplexer session reference (tmux session name).
    pub session_handle: Option<String>,
    pub workspace_path: PathBuf,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: InstanceCounters,
    /// Whether this instance is itself allowed to spawn children.
    pub enable_madrox: bool,
    /// Hash of the most recent pane capture, for quiescence detection.
    #[serde(skip)]
    pub last_capture_hash: Option<u64>,
    /// When the pane content last changed.
    #[serde(skip)]
    pub last_capture_change: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Create a fresh record in `Spawning` state with a new UUID identity.
    pub fn new(
        name: impl Into<String>,
        role: Role,
        kind: InstanceKind,
        workspace_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            role,
            kind,
            model: None,
            parent_id: None,
            team_session_id: None,
            session_handle: None,
            workspace_path,
            state: InstanceState::Spawning,
            created_at: now,
            last_activity: now,
            terminated_at: None,
            counters: InstanceCounters::default(),
            enable_madrox: false,
            last_capture_hash: None,
            last_capture_change: None,
        }
    }

    /// Whether this record is the root of the forest.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
