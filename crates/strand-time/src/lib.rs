//! STRAND Time - Injectable sources of time and randomness
//!
//! Everything that would otherwise be ambient global state is a strategy
//! trait here, passed into mergers and orchestrators through [`Env`]:
//! - [`Clock`]: logical timestamps, monotonic per process
//! - [`SaltSource`]: salt mixed into oplog hashes
//! - [`RandomSource`]: bytes for new IDs and keys
//!
//! Production wiring uses the OS-backed implementations; tests inject the
//! deterministic ones.

pub mod clock;
pub mod salt;
pub mod env;

pub use clock::*;
pub use salt::*;
pub use env::*;
