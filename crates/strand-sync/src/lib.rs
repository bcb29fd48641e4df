//! STRAND Sync Engine - Oplog merge and per-entity projections
//!
//! This crate implements the per-entity synchronization engine:
//! - Chain indexing and deterministic fork resolution
//! - Bounded buffering of out-of-order oplogs
//! - The oplog merger and its per-category apply hooks
//! - Master, member, op-key and content projections
//! - The protocol manager bundling all of the above for one entity

pub mod chain;
pub mod pending;
pub mod merge;
pub mod builder;
pub mod master;
pub mod member;
pub mod opkey;
pub mod object;
pub mod pm;

pub use chain::*;
pub use pending::*;
pub use merge::*;
pub use builder::*;
pub use master::*;
pub use member::*;
pub use opkey::*;
pub use object::*;
pub use pm::*;
