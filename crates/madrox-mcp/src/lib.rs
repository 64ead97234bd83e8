//! MCP tool surface for madrox.
//!
//! One dispatcher, two transports. [`dispatcher::handle_rpc`] is the pure
//! entry point; [`stdio`] frames it as newline-delimited JSON-RPC on
//! stdin/stdout and [`http`] serves the same bytes over POST plus a
//! WebSocket log stream. Caller identity on both transports comes from
//! [`caller::detect_caller`]'s busy/recent-activity heuristic.

pub mod caller;
pub mod dispatcher;
pub mod http;
pub mod stdio;
pub mod tools;

pub use caller::{detect_caller, CallerContext};
pub use dispatcher::{dispatch, handle_rpc};
