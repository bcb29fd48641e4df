//! STRAND Runtime - entity registry, join orchestration and the identity layer
//!
//! A node holds one identity and the entities it created or joined. Every
//! admission goes through `JoinOrchestrator::create_join_entity`, which
//! serializes on the entity's lock and wires up the entity's protocol
//! manager and sync service.

pub mod config;
pub mod entity;
pub mod join;
pub mod me;
pub mod node;
pub mod registry;
pub mod service;
pub mod telemetry;

pub use config::*;
pub use entity::*;
pub use join::*;
pub use me::*;
pub use node::*;
pub use registry::*;
pub use service::*;
