//! Pure in-memory backend

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::{Durability, KvStore, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Batched writes not yet flushed
    unflushed: usize,
    flushes: u64,
    closed: bool,
}

/// In-memory `KvStore`
///
/// Batched writes are visible immediately but counted as unflushed until an
/// important write or an explicit flush.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes awaiting a flush
    pub fn unflushed(&self) -> usize {
        self.inner.read().unflushed
    }

    /// Number of flushes performed
    pub fn flushes(&self) -> u64 {
        self.inner.read().flushes
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject all further operations
    pub fn close(&self) {
        self.inner.write().closed = true;
    }
}

impl KvStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8], durability: Durability) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.entries.insert(key.to_vec(), value.to_vec());
        match durability {
            Durability::Batched => inner.unflushed += 1,
            Durability::Important => {
                inner.unflushed = 0;
                inner.flushes += 1;
            }
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner.entries.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner
            .entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        inner.unflushed = 0;
        inner.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"a", b"1", Durability::Batched).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(b"log/b", b"2", Durability::Batched).unwrap();
        store.put(b"log/a", b"1", Durability::Batched).unwrap();
        store.put(b"loh", b"x", Durability::Batched).unwrap();
        store.put(b"lo", b"y", Durability::Batched).unwrap();

        let keys: Vec<_> = store
            .scan_prefix(b"log/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"log/a".to_vec(), b"log/b".to_vec()]);
    }

    #[test]
    fn test_important_write_flushes() {
        let store = MemoryStore::new();
        store.put(b"a", b"1", Durability::Batched).unwrap();
        store.put(b"b", b"1", Durability::Batched).unwrap();
        assert_eq!(store.unflushed(), 2);

        store.put(b"c", b"1", Durability::Important).unwrap();
        assert_eq!(store.unflushed(), 0);
        assert_eq!(store.flushes(), 1);
    }

    #[test]
    fn test_closed_store_errors() {
        let store = MemoryStore::new();
        store.close();
        assert!(matches!(
            store.put(b"a", b"1", Durability::Important),
            Err(StoreError::Closed)
        ));
    }
}
