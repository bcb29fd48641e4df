//! STRAND Transport Layer - Peer messaging boundary
//!
//! This crate provides:
//! - The messages peers exchange ([`PeerMessage`])
//! - The [`Peer`] and [`Transport`] traits the sync engine talks through
//! - An in-process loopback network for tests and demos
//!
//! Wire encoding of a real network transport is left to implementors.

pub mod message;
pub mod peer;
pub mod loopback;

pub use message::*;
pub use peer::*;
pub use loopback::*;
