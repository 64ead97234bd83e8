//! Terminal adapter errors.
//!
//! Two failure classes matter to callers: the session is gone (the instance
//! must move to `terminated` or `error`), or the multiplexer hiccuped
//! (retried once, then surfaced).

/// Error from a terminal backend operation.
#[derive(Debug, thiserror::Error)]
pub enum TermError {
    /// The pane/session no longer exists. Not retried.
    #[error("session '{session}' is gone: {message}")]
    SessionGone { session: String, message: String },

    /// A transient multiplexer failure. Retried once before surfacing.
    #[error("transient terminal error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// tmux is not installed or not runnable on this host.
    #[error("terminal multiplexer unavailable: {message}")]
    Unavailable { message: String },
}

impl TermError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn session_gone(session: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SessionGone {
            session: session.into(),
            message: message.into(),
        }
    }

    /// Whether a single retry is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
