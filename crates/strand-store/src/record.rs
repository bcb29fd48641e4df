//! JSON-encoded persisted records

use serde::de::DeserializeOwned;
use serde::Serialize;

use strand_core::StrandResult;

use crate::{Durability, KvStore, StoreError};

/// A value persisted under a key derived from its own ID
pub trait Record: Serialize + DeserializeOwned {
    fn storage_key(&self) -> Vec<u8>;

    /// Idempotent upsert; `is_important` requests durability before returning
    fn save(&self, store: &dyn KvStore, is_important: bool) -> StrandResult<()> {
        put_json(store, &self.storage_key(), self, Durability::from_important(is_important))
    }
}

pub fn put_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &[u8],
    value: &T,
    durability: Durability,
) -> StrandResult<()> {
    let bytes = serde_json::to_vec(value).map_err(StoreError::from)?;
    store.put(key, &bytes, durability)?;
    Ok(())
}

pub fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> StrandResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(StoreError::from)?)),
        None => Ok(None),
    }
}

/// Decode every value under `prefix`, skipping entries that fail to decode
pub fn scan_json<T: DeserializeOwned>(store: &dyn KvStore, prefix: &[u8]) -> StrandResult<Vec<T>> {
    let mut out = Vec::new();
    for (key, bytes) in store.scan_prefix(prefix)? {
        match serde_json::from_slice(&bytes) {
            Ok(value) => out.push(value),
            Err(e) => {
                tracing::warn!(key = %String::from_utf8_lossy(&key), error = %e, "Skipping undecodable record");
            }
        }
    }
    Ok(out)
}
