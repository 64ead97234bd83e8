//! Mock terminal backend for tests.
//!
//! Records every operation, simulates pane content (sent text is appended so
//! captures reflect delivery), and allows injection of one-shot errors for
//! failure-path coverage. No tmux required, so the orchestrator test suite
//! runs on any platform.

use crate::error::TermError;
use crate::session::{SessionHandle, TerminalBackend};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Call record for mock backend operations.
#[derive(Debug, Clone)]
pub enum MockCall {
    Start {
        session: String,
        command: String,
    },
    Capture {
        session: String,
    },
    SendKeys {
        session: String,
        text: String,
        with_enter: bool,
    },
    SendKey {
        session: String,
        key: String,
    },
    Paste {
        session: String,
        text: String,
    },
    Interrupt {
        session: String,
    },
    Kill {
        session: String,
    },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    panes: HashMap<String, String>,
    killed: HashMap<String, bool>,
    next_paste_error: Option<String>,
    next_send_error: Option<String>,
    next_start_error: Option<String>,
}

/// In-memory stand-in for [`crate::session::TmuxBackend`].
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session without going through `start`, for tests that
    /// exercise lower layers directly.
    pub fn preopen(&self, session: &str) -> SessionHandle {
        let mut state = self.state.lock().unwrap();
        state.panes.insert(session.to_string(), String::new());
        state.killed.insert(session.to_string(), false);
        SessionHandle(session.to_string())
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Replace a session's pane content (e.g. to script an error signature).
    pub fn set_pane_content(&self, session: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .panes
            .insert(session.to_string(), content.to_string());
    }

    /// Pane content as the next capture will see it.
    pub fn pane_content(&self, session: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .panes
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_next_paste(&self, message: &str) {
        self.state.lock().unwrap().next_paste_error = Some(message.to_string());
    }

    pub fn fail_next_send(&self, message: &str) {
        self.state.lock().unwrap().next_send_error = Some(message.to_string());
    }

    pub fn fail_next_start(&self, message: &str) {
        self.state.lock().unwrap().next_start_error = Some(message.to_string());
    }

    /// Simulate the session dying underneath the orchestrator.
    pub fn mark_gone(&self, session: &str) {
        self.state
            .lock()
            .unwrap()
            .killed
            .insert(session.to_string(), true);
    }

    pub fn is_killed(&self, session: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .killed
            .get(session)
            .copied()
            .unwrap_or(false)
    }

    fn check_live(state: &MockState, session: &str) -> Result<(), TermError> {
        match state.killed.get(session) {
            Some(false) => Ok(()),
            Some(true) => Err(TermError::session_gone(session, "session was killed")),
            None => Err(TermError::session_gone(session, "session never started")),
        }
    }
}

#[async_trait]
impl TerminalBackend for MockSession {
    async fn start(
        &self,
        session_name: &str,
        command: &str,
        _env: &[(String, String)],
        _cwd: &Path,
    ) -> Result<SessionHandle, TermError> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.next_start_error.take() {
            return Err(TermError::transient(msg));
        }
        state.calls.push(MockCall::Start {
            session: session_name.to_string(),
            command: command.to_string(),
        });
        state
            .panes
            .insert(session_name.to_string(), format!("$ {command}\n"));
        state.killed.insert(session_name.to_string(), false);
        Ok(SessionHandle(session_name.to_string()))
    }

    async fn capture_pane(&self, handle: &SessionHandle) -> Result<String, TermError> {
        let mut state = self.state.lock().unwrap();
        Self::check_live(&state, handle.as_str())?;
        state.calls.push(MockCall::Capture {
            session: handle.as_str().to_string(),
        });
        Ok(state.panes.get(handle.as_str()).cloned().unwrap_or_default())
    }

    async fn send_keys(
        &self,
        handle: &SessionHandle,
        text: &str,
        with_enter: bool,
    ) -> Result<(), TermError> {
        let mut state = self.state.lock().unwrap();
        Self::check_live(&state, handle.as_str())?;
        if let Some(msg) = state.next_send_error.take() {
            return Err(TermError::transient(msg));
        }
        state.calls.push(MockCall::SendKeys {
            session: handle.as_str().to_string(),
            text: text.to_string(),
            with_enter,
        });
        let pane = state.panes.entry(handle.as_str().to_string()).or_default();
        pane.push_str(text);
        if with_enter {
            pane.push('\n');
        }
        Ok(())
    }

    async fn send_key(&self, handle: &SessionHandle, key: &str) -> Result<(), TermError> {
        let mut state = self.state.lock().unwrap();
        Self::check_live(&state, handle.as_str())?;
        state.calls.push(MockCall::SendKey {
            session: handle.as_str().to_string(),
            key: key.to_string(),
        });
        if key == "Enter" || key == "C-j" {
            state
                .panes
                .entry(handle.as_str().to_string())
                .or_default()
                .push('\n');
        }
        Ok(())
    }

    async fn load_buffer_and_paste(
        &self,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<(), TermError> {
        let mut state = self.state.lock().unwrap();
        Self::check_live(&state, handle.as_str())?;
        if let Some(msg) = state.next_paste_error.take() {
            return Err(TermError::transient(msg));
        }
        state.calls.push(MockCall::Paste {
            session: handle.as_str().to_string(),
            text: text.to_string(),
        });
        state
            .panes
            .entry(handle.as_str().to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn interrupt(&self, handle: &SessionHandle) -> Result<(), TermError> {
        let mut state = self.state.lock().unwrap();
        Self::check_live(&state, handle.as_str())?;
        state.calls.push(MockCall::Interrupt {
            session: handle.as_str().to_string(),
        });
        Ok(())
    }

    async fn kill(&self, handle: &SessionHandle) -> Result<(), TermError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::Kill {
            session: handle.as_str().to_string(),
        });
        // Idempotent like the real backend.
        state.killed.insert(handle.as_str().to_string(), true);
        Ok(())
    }
}
