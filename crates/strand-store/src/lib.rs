//! STRAND Store - Persistence boundary
//!
//! The oplog engine persists through the [`KvStore`] trait only; the engine
//! behind it is the embedder's choice. This crate provides:
//! - The `KvStore` trait and `Durability` flag
//! - `MemoryStore`, a pure in-memory backend
//! - Key layout shared by every persisted object
//! - `Record`, the JSON-encoded idempotent upsert used by all persisted types

pub mod error;
pub mod kv;
pub mod memory;
pub mod keys;
pub mod record;

pub use error::*;
pub use kv::*;
pub use memory::*;
pub use keys::*;
pub use record::*;
