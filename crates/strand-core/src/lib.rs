//! STRAND Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout STRAND:
//! - Identifiers (Id, NodeId)
//! - Logical timestamps
//! - Oplog categories, operations and the oplog record itself
//! - Entity metadata shared by every entity kind
//! - Op keys and the join bundle

pub mod id;
pub mod time;
pub mod class;
pub mod oplog;
pub mod entity;
pub mod bundle;
pub mod error;

pub use id::*;
pub use time::*;
pub use class::*;
pub use oplog::*;
pub use entity::*;
pub use bundle::*;
pub use error::*;
