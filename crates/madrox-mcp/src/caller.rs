//! Caller identification for tool calls.
//!
//! Neither transport carries a trustworthy caller identity (stdio has a
//! single anonymous peer; HTTP adds no authentication), so the dispatcher
//! works from best-effort evidence: the most-recently-busy managed instance
//! is assumed to be the one currently executing a tool call. When nothing is
//! busy the detection fails and spawn-style tools reject with
//! `PARENT_REQUIRED` rather than guessing.

use madrox_core::InstanceState;
use madrox_orchestrator::InstanceRegistry;

/// Evidence about who issued the current tool call.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Instance id resolved from transport evidence, when detection worked.
    pub instance_id: Option<String>,
}

impl CallerContext {
    pub fn detected(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
        }
    }
}

/// Best-effort caller detection: the busy instance with the latest
/// `last_activity`. Returns `None` when no managed instance is busy:
/// ambiguity is a rejection, not a guess.
pub fn detect_caller(registry: &InstanceRegistry) -> Option<String> {
    registry
        .snapshot()
        .into_iter()
        .filter(|r| r.state == InstanceState::Busy)
        .max_by_key(|r| r.last_activity)
        .map(|r| r.id)
}
