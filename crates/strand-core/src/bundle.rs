//! Op keys and the join bundle exchanged between peers

use serde::{Deserialize, Serialize};

use crate::{EntityRecord, Id, Oplog, StrandError, StrandResult, Timestamp};

/// Symmetric key for an entity's encrypted oplog exchange
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKey {
    /// SHA-256 of `key`, used for lookup
    pub hash: Id,
    pub entity_id: Id,
    pub key: [u8; 32],
    /// CreateOpKey log that introduced the key
    pub log_id: Id,
    pub create_ts: Timestamp,
    pub expire_ts: Timestamp,
}

impl OpKey {
    /// Usable for new encryptions at `now`; expired keys still decrypt
    #[inline]
    pub fn is_active(&self, now: Timestamp) -> bool {
        now < self.expire_ts
    }
}

impl std::fmt::Debug for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpKey")
            .field("hash", &self.hash)
            .field("entity_id", &self.entity_id)
            .field("expire_ts", &self.expire_ts)
            .finish_non_exhaustive()
    }
}

/// Everything a device needs to admit an entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinBundle {
    pub entity: EntityRecord,
    /// Genesis log of the entity
    pub oplog0: Oplog,
    pub master_logs: Vec<Oplog>,
    pub member_logs: Vec<Oplog>,
    pub op_key: OpKey,
    pub op_key_log: Oplog,
}

impl JoinBundle {
    #[inline]
    pub fn entity_id(&self) -> Id {
        self.entity.meta.id
    }

    /// Structural checks that do not need keys or stored state
    pub fn check(&self) -> StrandResult<()> {
        let entity_id = self.entity_id();
        if entity_id.is_nil() {
            return Err(StrandError::InvalidBundle("nil entity id".into()));
        }
        if !entity_id.is_created_by(&self.entity.meta.creator_id) {
            return Err(StrandError::InvalidBundle(format!(
                "entity {:?} was not created by {:?}",
                entity_id, self.entity.meta.creator_id
            )));
        }
        if self.op_key.entity_id != entity_id {
            return Err(StrandError::InvalidBundle("op key bound to another entity".into()));
        }
        if self.op_key.log_id != self.op_key_log.id {
            return Err(StrandError::InvalidBundle("op key log mismatch".into()));
        }
        Ok(())
    }
}
