//! Master registry
//!
//! The master set of an entity is a fold over its master-oplog chains: one
//! chain per master identity, whose canonical head decides the status.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use strand_core::{Id, Op, Oplog, OplogCategory, StrandError, StrandResult, Timestamp};
use strand_store::{projection_key, projection_prefix, scan_json, KvStore, Record};
use strand_transport::{PeerMessage, Transport};

use crate::OplogHandler;

const MASTER_KIND: &str = "master";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterStatus {
    Alive,
    Transferred,
    Revoked,
}

impl MasterStatus {
    pub fn from_op(op: Op) -> Option<Self> {
        match op {
            Op::AddMaster => Some(MasterStatus::Alive),
            Op::TransferMaster => Some(MasterStatus::Transferred),
            Op::RevokeMaster => Some(MasterStatus::Revoked),
            _ => None,
        }
    }
}

/// One master slot of an entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    /// Master identity
    pub id: Id,
    pub entity_id: Id,
    pub status: MasterStatus,
    /// Canonical head of the slot's chain
    pub log_id: Id,
    pub update_ts: Timestamp,
}

impl Record for Master {
    fn storage_key(&self) -> Vec<u8> {
        projection_key(MASTER_KIND, &self.entity_id, &self.id)
    }
}

/// Master projection and live master sessions of one entity
pub struct MasterRegistry {
    entity_id: Id,
    local_id: Option<Id>,
    store: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    masters: RwLock<HashMap<Id, Master>>,
    /// Alive masters, cleared by every apply
    alive_cache: RwLock<Option<Vec<Master>>>,
    sessions: Mutex<HashSet<Id>>,
}

impl MasterRegistry {
    pub fn new(entity_id: Id, local_id: Option<Id>, store: Arc<dyn KvStore>, transport: Arc<dyn Transport>) -> Self {
        MasterRegistry {
            entity_id,
            local_id,
            store,
            transport,
            masters: RwLock::new(HashMap::new()),
            alive_cache: RwLock::new(None),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Alive masters ordered by ID; `force_reload` re-reads the store
    pub fn master_list(&self, force_reload: bool) -> StrandResult<Vec<Master>> {
        if force_reload {
            self.reload()?;
        } else if let Some(cached) = self.alive_cache.read().as_ref() {
            return Ok(cached.clone());
        }

        let mut alive: Vec<Master> = self
            .masters
            .read()
            .values()
            .filter(|m| m.status == MasterStatus::Alive)
            .cloned()
            .collect();
        alive.sort_by_key(|m| m.id);
        *self.alive_cache.write() = Some(alive.clone());
        Ok(alive)
    }

    pub fn get(&self, id: &Id) -> Option<Master> {
        self.masters.read().get(id).cloned()
    }

    pub fn is_alive(&self, id: &Id) -> bool {
        self.masters
            .read()
            .get(id)
            .map_or(false, |m| m.status == MasterStatus::Alive)
    }

    /// Establish a live session with the devices of `master`
    ///
    /// Registering an already registered master is a no-op. With `is_start`
    /// a first master-log sync is requested from that master.
    pub async fn register_master(&self, master: &Master, is_start: bool) -> StrandResult<()> {
        if self.sessions.lock().contains(&master.id) {
            return Ok(());
        }

        self.transport.register_peer(self.entity_id, master.id).await?;
        self.sessions.lock().insert(master.id);
        tracing::debug!(entity = %self.entity_id, master = ?master.id, "Registered master");

        if is_start && Some(master.id) != self.local_id {
            let request = PeerMessage::SyncRequest {
                entity_id: self.entity_id,
                category: OplogCategory::Master,
                since: Timestamp::ZERO,
            };
            self.transport.send_to(self.entity_id, master.id, request).await?;
        }
        Ok(())
    }

    pub fn is_registered(&self, id: &Id) -> bool {
        self.sessions.lock().contains(id)
    }
}

impl OplogHandler for MasterRegistry {
    fn category(&self) -> OplogCategory {
        OplogCategory::Master
    }

    fn apply(&self, obj_id: &Id, chain: &[&Oplog]) -> StrandResult<()> {
        let Some(head) = chain.last() else {
            return Ok(());
        };
        let status = MasterStatus::from_op(head.op).ok_or(StrandError::InvalidOp {
            op: head.op,
            category: OplogCategory::Master,
        })?;

        let master = Master {
            id: *obj_id,
            entity_id: self.entity_id,
            status,
            log_id: head.id,
            update_ts: head.create_ts,
        };
        master.save(self.store.as_ref(), false)?;

        if status != MasterStatus::Alive {
            self.sessions.lock().remove(obj_id);
        }
        self.masters.write().insert(*obj_id, master);
        *self.alive_cache.write() = None;
        Ok(())
    }

    fn reload(&self) -> StrandResult<()> {
        let stored: Vec<Master> = scan_json(self.store.as_ref(), &projection_prefix(MASTER_KIND, &self.entity_id))?;
        let mut masters = self.masters.write();
        masters.clear();
        for master in stored {
            masters.insert(master.id, master);
        }
        *self.alive_cache.write() = None;
        Ok(())
    }
}
