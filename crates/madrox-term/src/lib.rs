//! Terminal multiplexer adapter for madrox.
//!
//! One tmux session per managed instance. [`session::TmuxBackend`] owns the
//! tmux CLI plumbing; [`inject::PromptInjector`] routes prompts through the
//! paste buffer or the keystroke path depending on size; [`mock::MockSession`]
//! is the in-memory test double used by the orchestrator test suite.

pub mod error;
pub mod inject;
pub mod mock;
pub mod session;

pub use error::TermError;
pub use inject::{InjectionPath, PromptInjector};
pub use mock::{MockCall, MockSession};
pub use session::{SessionHandle, TerminalBackend, TmuxBackend};
