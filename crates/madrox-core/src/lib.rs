//! Core types and schemas for madrox.
//!
//! This crate provides the fundamental data structures shared by the
//! orchestrator, the terminal layer, and the MCP transports:
//!
//! - Instance records, roles, kinds, and the instance state machine
//! - Message envelopes and bounded per-instance queues
//! - Environment-driven configuration
//! - The tool-facing error taxonomy with stable wire strings
//! - Structured system/audit logging with live broadcast to subscribers

pub mod audit;
pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod message;

pub use config::{Config, ConfigError, TransportMode};
pub use error::{ToolError, ToolErrorKind};
pub use instance::{InstanceKind, InstanceRecord, InstanceState, Role};
pub use message::{MessageEnvelope, MessageKind, MessageQueue};
