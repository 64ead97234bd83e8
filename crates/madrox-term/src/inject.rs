//! Prompt injection with paste-guard bypass.
//!
//! Interactive AI CLIs detect rapid keystroke streams as a paste and open a
//! confirmation prompt, which would strand an injected message. The tmux
//! paste buffer arrives as a single terminal event and skips that heuristic,
//! so large prompts go through `set-buffer`/`paste-buffer` while small ones
//! are streamed as keystrokes, line by line, with a soft-newline key between
//! lines and one Enter at the end.

use crate::error::TermError;
use crate::session::{SessionHandle, TerminalBackend};
use madrox_core::InstanceKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Settle delay after a paste before Enter is pressed.
const PASTE_SETTLE_MS: u64 = 100;
/// Base settle delay for the keystroke path.
const KEYSTROKE_SETTLE_BASE_MS: u64 = 50;
/// Additional settle per KiB of message on the keystroke path.
const KEYSTROKE_SETTLE_PER_KIB_MS: u64 = 50;

/// Which input path delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPath {
    Keystrokes,
    PasteBuffer,
    /// Paste was attempted but failed; the keystroke path delivered.
    PasteFallback,
}

/// Routes prompts of arbitrary size into a running child CLI.
#[derive(Clone)]
pub struct PromptInjector {
    backend: Arc<dyn TerminalBackend>,
    /// Messages at or above this many bytes take the paste path.
    threshold: usize,
}

impl PromptInjector {
    pub fn new(backend: Arc<dyn TerminalBackend>, threshold: usize) -> Self {
        Self {
            backend,
            threshold: threshold.max(1),
        }
    }

    /// Deliver `text` to the pane and submit it with Enter.
    ///
    /// Never drops the message: a paste-buffer failure degrades to the
    /// keystroke path with a warning.
    pub async fn inject(
        &self,
        handle: &SessionHandle,
        kind: InstanceKind,
        text: &str,
    ) -> Result<InjectionPath, TermError> {
        if text.len() < self.threshold {
            self.inject_keystrokes(handle, kind, text).await?;
            return Ok(InjectionPath::Keystrokes);
        }

        match self.backend.load_buffer_and_paste(handle, text).await {
            Ok(()) => {
                tokio::time::sleep(Duration::from_millis(PASTE_SETTLE_MS)).await;
                self.backend.send_key(handle, "Enter").await?;
                debug!(
                    "pasted {} bytes into '{}' via buffer",
                    text.len(),
                    handle.as_str()
                );
                Ok(InjectionPath::PasteBuffer)
            }
            Err(e) => {
                warn!(
                    "paste buffer failed for '{}', degrading to keystrokes: {e}",
                    handle.as_str()
                );
                self.inject_keystrokes(handle, kind, text).await?;
                Ok(InjectionPath::PasteFallback)
            }
        }
    }

    /// Stream `text` as literal keystrokes: soft newline between lines, a
    /// settle delay proportional to message size, one Enter at the end.
    async fn inject_keystrokes(
        &self,
        handle: &SessionHandle,
        kind: InstanceKind,
        text: &str,
    ) -> Result<(), TermError> {
        let mut lines = text.split('\n').peekable();
        while let Some(line) = lines.next() {
            if !line.is_empty() {
                self.backend.send_keys(handle, line, false).await?;
            }
            if lines.peek().is_some() {
                self.backend.send_key(handle, kind.soft_newline_key()).await?;
            }
        }
        tokio::time::sleep(Duration::from_millis(settle_delay_ms(text.len()))).await;
        self.backend.send_key(handle, "Enter").await
    }
}

fn settle_delay_ms(len: usize) -> u64 {
    KEYSTROKE_SETTLE_BASE_MS + (len as u64 / 1024) * KEYSTROKE_SETTLE_PER_KIB_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockSession};

    fn injector(mock: &MockSession) -> PromptInjector {
        PromptInjector::new(Arc::new(mock.clone()), 3 * 1024)
    }

    #[tokio::test]
    async fn small_message_uses_keystroke_path_only() {
        let mock = MockSession::new();
        let handle = mock.preopen("w1");
        let path = injector(&mock)
            .inject(&handle, InstanceKind::Claude, "hello")
            .await
            .unwrap();
        assert_eq!(path, InjectionPath::Keystrokes);
        let calls = mock.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, MockCall::SendKeys { text, .. } if text == "hello")));
        assert!(!calls.iter().any(|c| matches!(c, MockCall::Paste { .. })));
        // Submission ends with exactly one Enter.
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, MockCall::SendKey { key, .. } if key == "Enter"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn multiline_message_gets_soft_newlines() {
        let mock = MockSession::new();
        let handle = mock.preopen("w1");
        injector(&mock)
            .inject(&handle, InstanceKind::Claude, "one\ntwo\nthree")
            .await
            .unwrap();
        let soft = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::SendKey { key, .. } if key == "C-j"))
            .count();
        assert_eq!(soft, 2);
    }

    #[tokio::test]
    async fn large_message_takes_paste_path_exactly_once() {
        let mock = MockSession::new();
        let handle = mock.preopen("w1");
        let big = "x".repeat(4096);
        let path = injector(&mock)
            .inject(&handle, InstanceKind::Codex, &big)
            .await
            .unwrap();
        assert_eq!(path, InjectionPath::PasteBuffer);
        let calls = mock.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, MockCall::Paste { .. }))
                .count(),
            1
        );
        assert!(!calls.iter().any(|c| matches!(c, MockCall::SendKeys { .. })));
    }

    #[tokio::test]
    async fn threshold_boundary_is_inclusive() {
        let mock = MockSession::new();
        let handle = mock.preopen("w1");
        let exact = "y".repeat(3 * 1024);
        let path = injector(&mock)
            .inject(&handle, InstanceKind::Claude, &exact)
            .await
            .unwrap();
        assert_eq!(path, InjectionPath::PasteBuffer);
    }

    #[tokio::test]
    async fn paste_failure_degrades_to_keystrokes() {
        let mock = MockSession::new();
        let handle = mock.preopen("w1");
        mock.fail_next_paste("buffer error");
        let big = "z".repeat(5000);
        let path = injector(&mock)
            .inject(&handle, InstanceKind::Claude, &big)
            .await
            .unwrap();
        assert_eq!(path, InjectionPath::PasteFallback);
        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::SendKeys { .. })));
    }
}
