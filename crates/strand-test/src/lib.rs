//! STRAND Test Harness - Multi-node sync validation
//!
//! This crate provides:
//! - A loopback cluster of full nodes sharing one deterministic environment
//! - A recording store exposing the order of durable entity writes
//! - End-to-end scenarios covering admission, fork resolution, identity
//!   replay and pull sync

pub mod harness;
pub mod scenarios;

pub use harness::*;
