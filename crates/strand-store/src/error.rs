//! Error types for the store crate

use strand_core::StrandError;

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend read or write failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Store was closed
    #[error("store closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<StoreError> for StrandError {
    fn from(e: StoreError) -> Self {
        StrandError::Storage(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
