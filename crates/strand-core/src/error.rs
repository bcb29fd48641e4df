//! Error types for STRAND

use thiserror::Error;

use crate::{Id, Op, OplogCategory};

/// Core STRAND errors
#[derive(Error, Debug)]
pub enum StrandError {
    // Validation errors
    #[error("Invalid oplog hash: {0:?}")]
    InvalidHash(Id),

    #[error("Invalid oplog signature: {0:?}")]
    InvalidSignature(Id),

    #[error("Creator {0:?} does not match the signing key")]
    CreatorMismatch(Id),

    #[error("Op {op:?} is not valid in category {category}")]
    InvalidOp { op: Op, category: OplogCategory },

    #[error("Master log {master_log_id:?} does not authorize creator {creator_id:?}")]
    UnauthorizedMaster { master_log_id: Id, creator_id: Id },

    #[error("Missing dependency: {0:?}")]
    MissingDependency(Id),

    #[error("Oplog {0:?} does not extend its predecessor's chain")]
    BrokenChain(Id),

    #[error("Invalid join bundle: {0}")]
    InvalidBundle(String),

    // Entity errors
    #[error("Entity not found: {0:?}")]
    EntityNotFound(Id),

    #[error("Unknown entity kind: {0}")]
    UnknownEntityKind(String),

    // Key errors
    #[error("Op key not found: {0:?}")]
    OpKeyNotFound(Id),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Key derivation failed")]
    KeyDerivation,

    // Concurrency errors
    #[error("Timed out acquiring lock for entity {0:?}")]
    LockTimeout(Id),

    #[error("Entity registry is closed")]
    RegistryClosed,

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Peer errors
    #[error("Peer delivery failed: {0}")]
    PeerDelivery(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl StrandError {
    /// Errors that abort a whole merge instead of rejecting one log
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrandError::Storage(_))
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(e: serde_json::Error) -> Self {
        StrandError::Serialization(e.to_string())
    }
}

/// Result type for STRAND operations
pub type StrandResult<T> = Result<T, StrandError>;
