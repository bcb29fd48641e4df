//! Key-value persistence trait

use crate::StoreResult;

/// Write durability
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Durability {
    /// May sit in a write batch until the next flush
    #[default]
    Batched,
    /// Durable before `put` returns
    Important,
}

impl Durability {
    #[inline]
    pub fn from_important(is_important: bool) -> Self {
        if is_important {
            Durability::Important
        } else {
            Durability::Batched
        }
    }
}

/// Ordered key-value store
///
/// Calls are synchronous and may block. Writes are idempotent upserts;
/// reads observe every earlier write regardless of durability.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8], durability: Durability) -> StoreResult<()>;

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Make every batched write durable
    fn flush(&self) -> StoreResult<()>;
}
