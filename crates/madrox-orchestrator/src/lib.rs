//! Orchestration core for madrox.
//!
//! Owns the authoritative instance registry and state machine, the
//! correlation-tracked message bus, the supervision loop, and the artifact
//! collector, all fronted by [`manager::InstanceManager`], the facade every
//! MCP tool handler talks to.

pub mod artifacts;
pub mod bus;
pub mod manager;
pub mod registry;
pub mod supervisor;

pub use bus::MessageBus;
pub use manager::{InstanceManager, SpawnRequest};
pub use registry::{InstanceRegistry, RegistryError};
pub use supervisor::Supervisor;
