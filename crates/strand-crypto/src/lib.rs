//! STRAND Crypto - Signing, hashing and op-key encryption
//!
//! Provides the cryptographic collaborators of the oplog engine:
//! - Identity management (Ed25519), IDs bound to the public key
//! - Oplog hashing, signing, verification and master co-signing
//! - Op-key payload encryption (ChaCha20-Poly1305)
//! - Op-key derivation and rotation (HKDF-SHA256)
//!
//! Everything here is pure; randomness comes in through `RandomSource`.

pub mod aead;
pub mod identity;
pub mod keychain;
pub mod oplog;

pub use aead::*;
pub use identity::*;
pub use keychain::*;
pub use oplog::*;
