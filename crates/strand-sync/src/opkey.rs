//! Operation-key registry
//!
//! Op keys encrypt the oplog payloads peers exchange for an entity. Keys are
//! introduced by `CreateOpKey` logs, looked up by hash and never replaced;
//! several keys are active at once while a rotation propagates.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use strand_core::{Id, Op, OpKey, Oplog, OplogCategory, StrandError, StrandResult, Timestamp};
use strand_crypto::op_key_hash;
use strand_store::{projection_key, projection_prefix, put_json, scan_json, Durability, KvStore};

use crate::OplogHandler;

const OPKEY_KIND: &str = "opkey";

/// Payload of a `CreateOpKey` log
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKeyPayload {
    pub key: [u8; 32],
    pub expire_ts: Timestamp,
}

impl std::fmt::Debug for OpKeyPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpKeyPayload")
            .field("expire_ts", &self.expire_ts)
            .finish_non_exhaustive()
    }
}

/// Persist an op key under its hash
pub fn save_op_key(store: &dyn KvStore, key: &OpKey, is_important: bool) -> StrandResult<()> {
    put_json(
        store,
        &projection_key(OPKEY_KIND, &key.entity_id, &key.hash),
        key,
        Durability::from_important(is_important),
    )
}

pub struct OpKeyRegistry {
    entity_id: Id,
    store: Arc<dyn KvStore>,
    keys: RwLock<HashMap<Id, OpKey>>,
}

impl OpKeyRegistry {
    pub fn new(entity_id: Id, store: Arc<dyn KvStore>) -> Self {
        OpKeyRegistry {
            entity_id,
            store,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Activate `key`
    ///
    /// A key already registered under the same hash is kept as is.
    pub fn register_op_key(&self, key: OpKey) -> StrandResult<()> {
        if key.entity_id != self.entity_id {
            return Err(StrandError::InvalidBundle(format!(
                "op key {:?} belongs to entity {:?}",
                key.hash, key.entity_id
            )));
        }
        if op_key_hash(&key.key) != key.hash {
            return Err(StrandError::InvalidHash(key.hash));
        }

        let mut keys = self.keys.write();
        if !keys.contains_key(&key.hash) {
            tracing::debug!(entity = %self.entity_id, key = ?key.hash, "Registered op key");
            keys.insert(key.hash, key);
        }
        Ok(())
    }

    /// Drop keys that fail their hash or whose introducing log is unknown
    pub fn retain_logged(&self, is_logged: impl Fn(&Id) -> bool) {
        let entity_id = self.entity_id;
        self.keys.write().retain(|hash, key| {
            let keep = op_key_hash(&key.key) == *hash && is_logged(&key.log_id);
            if !keep {
                tracing::warn!(entity = %entity_id, key = ?hash, "Discarding op key without a valid log");
            }
            keep
        });
    }

    pub fn get(&self, hash: &Id) -> Option<OpKey> {
        self.keys.read().get(hash).cloned()
    }

    /// Active key with the latest expiry, for new encryptions
    pub fn newest_active(&self, now: Timestamp) -> Option<OpKey> {
        self.keys
            .read()
            .values()
            .filter(|k| k.is_active(now))
            .max_by_key(|k| (k.expire_ts, k.hash))
            .cloned()
    }

    pub fn all(&self) -> Vec<OpKey> {
        let mut keys: Vec<OpKey> = self.keys.read().values().cloned().collect();
        keys.sort_by_key(|k| (k.create_ts, k.hash));
        keys
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl OplogHandler for OpKeyRegistry {
    fn category(&self) -> OplogCategory {
        OplogCategory::OpKey
    }

    fn validate(&self, log: &Oplog) -> StrandResult<()> {
        if log.op == Op::RevokeOpKey && log.is_root() {
            return Err(StrandError::BrokenChain(log.id));
        }
        if log.op != Op::CreateOpKey {
            return Ok(());
        }
        if !log.is_root() {
            return Err(StrandError::BrokenChain(log.id));
        }
        let payload: OpKeyPayload = log.extra_as()?;
        if op_key_hash(&payload.key) != log.obj_id {
            return Err(StrandError::InvalidHash(log.id));
        }
        Ok(())
    }

    fn apply(&self, obj_id: &Id, chain: &[&Oplog]) -> StrandResult<()> {
        let (Some(root), Some(head)) = (chain.first(), chain.last()) else {
            return Ok(());
        };
        if root.op != Op::CreateOpKey {
            return Err(StrandError::InvalidOp {
                op: root.op,
                category: OplogCategory::OpKey,
            });
        }

        let payload: OpKeyPayload = root.extra_as()?;
        let mut expire_ts = payload.expire_ts;
        if head.op == Op::RevokeOpKey {
            expire_ts = expire_ts.min(head.create_ts);
        }

        let key = OpKey {
            hash: *obj_id,
            entity_id: self.entity_id,
            key: payload.key,
            log_id: root.id,
            create_ts: root.create_ts,
            expire_ts,
        };
        save_op_key(self.store.as_ref(), &key, false)?;

        // A revocation shortens the expiry of an already registered key
        let mut keys = self.keys.write();
        match keys.get_mut(obj_id) {
            Some(existing) => existing.expire_ts = existing.expire_ts.min(expire_ts),
            None => {
                keys.insert(*obj_id, key);
            }
        }
        Ok(())
    }

    fn reload(&self) -> StrandResult<()> {
        let stored: Vec<OpKey> = scan_json(self.store.as_ref(), &projection_prefix(OPKEY_KIND, &self.entity_id))?;
        let mut keys = self.keys.write();
        keys.clear();
        for key in stored {
            keys.insert(key.hash, key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_store::MemoryStore;

    fn op_key(entity_id: Id, byte: u8, expire_secs: i64) -> OpKey {
        let key = [byte; 32];
        OpKey {
            hash: op_key_hash(&key),
            entity_id,
            key,
            log_id: Id::new([byte.wrapping_add(1); 32]),
            create_ts: Timestamp::from_secs(1),
            expire_ts: Timestamp::from_secs(expire_secs),
        }
    }

    #[test]
    fn test_register_never_overwrites() {
        let entity = Id::new([1; 32]);
        let registry = OpKeyRegistry::new(entity, Arc::new(MemoryStore::new()));
        let first = op_key(entity, 7, 100);
        registry.register_op_key(first.clone()).unwrap();

        let mut replay = first.clone();
        replay.expire_ts = Timestamp::from_secs(999);
        registry.register_op_key(replay).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&first.hash).unwrap().expire_ts, first.expire_ts);
    }

    #[test]
    fn test_register_rejects_foreign_or_forged_key() {
        let entity = Id::new([1; 32]);
        let registry = OpKeyRegistry::new(entity, Arc::new(MemoryStore::new()));

        assert!(registry.register_op_key(op_key(Id::new([2; 32]), 7, 100)).is_err());

        let mut forged = op_key(entity, 7, 100);
        forged.key = [8; 32];
        assert!(matches!(registry.register_op_key(forged), Err(StrandError::InvalidHash(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_newest_active() {
        let entity = Id::new([1; 32]);
        let registry = OpKeyRegistry::new(entity, Arc::new(MemoryStore::new()));
        let old = op_key(entity, 3, 10);
        let new = op_key(entity, 4, 20);
        registry.register_op_key(old.clone()).unwrap();
        registry.register_op_key(new.clone()).unwrap();

        assert_eq!(registry.newest_active(Timestamp::from_secs(5)).unwrap().hash, new.hash);
        assert_eq!(registry.newest_active(Timestamp::from_secs(15)).unwrap().hash, new.hash);
        assert!(registry.newest_active(Timestamp::from_secs(25)).is_none());
        // Expired keys stay available for decryption
        assert!(registry.get(&old.hash).is_some());
    }

    #[test]
    fn test_revoke_shortens_expiry() {
        let entity = Id::new([1; 32]);
        let registry = OpKeyRegistry::new(entity, Arc::new(MemoryStore::new()));
        let key = [9u8; 32];
        let hash = op_key_hash(&key);
        let payload = OpKeyPayload {
            key,
            expire_ts: Timestamp::from_secs(100),
        };
        let create = Oplog::new(Id::new([2; 32]), hash, Op::CreateOpKey, Id::NIL, Id::NIL, Id::NIL, Timestamp::from_secs(1))
            .with_extra(&payload)
            .unwrap();
        let revoke = Oplog::new(Id::new([3; 32]), hash, Op::RevokeOpKey, create.id, Id::NIL, Id::NIL, Timestamp::from_secs(40));

        registry.validate(&create).unwrap();
        registry.apply(&hash, &[&create]).unwrap();
        assert_eq!(registry.get(&hash).unwrap().expire_ts, Timestamp::from_secs(100));

        registry.apply(&hash, &[&create, &revoke]).unwrap();
        assert_eq!(registry.get(&hash).unwrap().expire_ts, Timestamp::from_secs(40));
    }

    #[test]
    fn test_validate_rejects_mismatched_hash() {
        let registry = OpKeyRegistry::new(Id::new([1; 32]), Arc::new(MemoryStore::new()));
        let payload = OpKeyPayload {
            key: [9; 32],
            expire_ts: Timestamp::from_secs(100),
        };
        let log = Oplog::new(Id::new([2; 32]), Id::new([5; 32]), Op::CreateOpKey, Id::NIL, Id::NIL, Id::NIL, Timestamp::from_secs(1))
            .with_extra(&payload)
            .unwrap();
        assert!(matches!(registry.validate(&log), Err(StrandError::InvalidHash(_))));
    }
}
