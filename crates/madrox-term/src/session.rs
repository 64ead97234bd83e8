//! tmux session control.
//!
//! Each managed instance owns one detached tmux session. All text sends use
//! literal mode (`-l`) to prevent command injection, panes are validated
//! before every send, and a per-pane minimum send interval keeps rapid
//! successive sends from interleaving inside the child CLI's input box.
//! Transient tmux failures are retried once with a short backoff.

use crate::error::TermError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const BASE_BACKOFF_MS: u64 = 100;
const MIN_SEND_INTERVAL_MS: u64 = 200;
const DEFAULT_CAPTURE_LINES: u32 = 200;

static LAST_SEND_BY_SESSION: OnceLock<Mutex<HashMap<String, Instant>>> = OnceLock::new();

fn last_send_map() -> &'static Mutex<HashMap<String, Instant>> {
    LAST_SEND_BY_SESSION.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Opaque reference to a multiplexer session (the tmux session name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Abstraction over the terminal multiplexer.
///
/// Production code uses [`TmuxBackend`]; tests use
/// [`crate::mock::MockSession`]. All operations report [`TermError`] with the
/// session-gone / transient distinction the orchestrator relies on.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Launch `command` inside a fresh detached session and return its handle.
    async fn start(
        &self,
        session_name: &str,
        command: &str,
        env: &[(String, String)],
        cwd: &Path,
    ) -> Result<SessionHandle, TermError>;

    /// Current visible + scrollback pane contents, bounded by the capture
    /// window.
    async fn capture_pane(&self, handle: &SessionHandle) -> Result<String, TermError>;

    /// Inject literal text as terminal input, optionally followed by Enter.
    async fn send_keys(
        &self,
        handle: &SessionHandle,
        text: &str,
        with_enter: bool,
    ) -> Result<(), TermError>;

    /// Press a named key (e.g. `Enter`, `C-j`).
    async fn send_key(&self, handle: &SessionHandle, key: &str) -> Result<(), TermError>;

    /// Load `text` into the multiplexer paste buffer and paste it into the
    /// pane as a single terminal event.
    async fn load_buffer_and_paste(
        &self,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<(), TermError>;

    /// Deliver the interrupt keystroke (SIGINT via keyboard).
    async fn interrupt(&self, handle: &SessionHandle) -> Result<(), TermError>;

    /// Terminate the session, freeing the PTY. Idempotent: a session that is
    /// already gone is a success.
    async fn kill(&self, handle: &SessionHandle) -> Result<(), TermError>;
}

/// Retry a fallible operation once when the error is transient.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T, TermError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, TermError>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(e) if e.is_retryable() => {
            debug!("transient terminal error, retrying once: {e}");
            tokio::time::sleep(Duration::from_millis(BASE_BACKOFF_MS)).await;
            op().await
        }
        Err(e) => Err(e),
    }
}

/// Production backend driving the `tmux` CLI.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    capture_lines: u32,
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self {
            capture_lines: DEFAULT_CAPTURE_LINES,
        }
    }
}

impl TmuxBackend {
    pub fn new(capture_lines: u32) -> Self {
        Self { capture_lines }
    }

    fn tmux_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    /// Classify a failed tmux invocation: a missing session is `SessionGone`,
    /// everything else is `Transient`.
    fn classify_failure(session: &str, stderr: &str) -> TermError {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("can't find session")
            || lower.contains("no such session")
            || lower.contains("session not found")
            || lower.contains("can't find pane")
        {
            TermError::session_gone(session, stderr.trim().to_string())
        } else {
            TermError::transient(format!("tmux failed for '{session}': {}", stderr.trim()))
        }
    }

    fn run_tmux(&self, session: &str, args: &[&str]) -> Result<String, TermError> {
        let output = Command::new("tmux").args(args).output().map_err(|e| {
            TermError::Transient {
                message: format!("failed to run tmux: {e}"),
                source: Some(Box::new(e)),
            }
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Self::classify_failure(
                session,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Check the session still exists before sending anything into it.
    fn validate_session(&self, session: &str) -> Result<(), TermError> {
        self.run_tmux(
            session,
            &["display-message", "-p", "-t", session, "#{pane_id}"],
        )
        .map(|_| ())
    }

    async fn enforce_min_send_interval(&self, session: &str) {
        let delay = {
            match last_send_map().lock() {
                Ok(map) => map.get(session).and_then(|last| {
                    let elapsed = last.elapsed();
                    let min = Duration::from_millis(MIN_SEND_INTERVAL_MS);
                    (elapsed < min).then(|| min - elapsed)
                }),
                Err(_) => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut map) = last_send_map().lock() {
            map.insert(session.to_string(), Instant::now());
        }
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    async fn start(
        &self,
        session_name: &str,
        command: &str,
        env: &[(String, String)],
        cwd: &Path,
    ) -> Result<SessionHandle, TermError> {
        if !Self::tmux_available() {
            return Err(TermError::Unavailable {
                message: "tmux is not installed or not on PATH".to_string(),
            });
        }

        let cwd_str = cwd.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            session_name.into(),
            "-c".into(),
            cwd_str,
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_tmux(session_name, &arg_refs)?;
        debug!("created tmux session '{session_name}'");

        let handle = SessionHandle(session_name.to_string());
        // Launch the CLI as a typed command so the pane keeps a shell under
        // it when the child exits (post-mortem capture stays possible).
        self.send_keys(&handle, command, true).await?;
        Ok(handle)
    }

    async fn capture_pane(&self, handle: &SessionHandle) -> Result<String, TermError> {
        let lines = format!("-{}", self.capture_lines);
        with_retry(|| async {
            self.run_tmux(
                handle.as_str(),
                &["capture-pane", "-p", "-t", handle.as_str(), "-S", &lines],
            )
        })
        .await
    }

    async fn send_keys(
        &self,
        handle: &SessionHandle,
        text: &str,
        with_enter: bool,
    ) -> Result<(), TermError> {
        self.enforce_min_send_interval(handle.as_str()).await;
        with_retry(|| async {
            self.validate_session(handle.as_str())?;
            self.run_tmux(
                handle.as_str(),
                &["send-keys", "-t", handle.as_str(), "-l", text],
            )?;
            Ok(())
        })
        .await?;
        if with_enter {
            self.send_key(handle, "Enter").await?;
        }
        Ok(())
    }

    async fn send_key(&self, handle: &SessionHandle, key: &str) -> Result<(), TermError> {
        with_retry(|| async {
            self.validate_session(handle.as_str())?;
            self.run_tmux(handle.as_str(), &["send-keys", "-t", handle.as_str(), key])?;
            Ok(())
        })
        .await
    }

    async fn load_buffer_and_paste(
        &self,
        handle: &SessionHandle,
        text: &str,
    ) -> Result<(), TermError> {
        self.enforce_min_send_interval(handle.as_str()).await;
        let buffer_name = format!("madrox-{}", uuid::Uuid::new_v4());
        with_retry(|| async {
            self.validate_session(handle.as_str())?;
            self.run_tmux(
                handle.as_str(),
                &["set-buffer", "-b", &buffer_name, "--", text],
            )?;
            // -d frees the buffer after pasting.
            self.run_tmux(
                handle.as_str(),
                &["paste-buffer", "-d", "-b", &buffer_name, "-t", handle.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn interrupt(&self, handle: &SessionHandle) -> Result<(), TermError> {
        with_retry(|| async {
            self.run_tmux(handle.as_str(), &["send-keys", "-t", handle.as_str(), "C-c"])?;
            Ok(())
        })
        .await
    }

    async fn kill(&self, handle: &SessionHandle) -> Result<(), TermError> {
        match self.run_tmux(handle.as_str(), &["kill-session", "-t", handle.as_str()]) {
            Ok(_) => Ok(()),
            // Killing an already-dead session is a success.
            Err(TermError::SessionGone { .. }) => Ok(()),
            Err(e) => {
                warn!("kill-session '{}' failed: {e}", handle.as_str());
                Err(e)
            }
        }
    }
}
