//! Member registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use strand_core::{Id, Op, Oplog, OplogCategory, StrandError, StrandResult, Timestamp};
use strand_store::{projection_key, projection_prefix, scan_json, KvStore, Record};

use crate::OplogHandler;

const MEMBER_KIND: &str = "member";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Id,
    pub entity_id: Id,
    pub status: MemberStatus,
    pub log_id: Id,
    pub update_ts: Timestamp,
}

impl Record for Member {
    fn storage_key(&self) -> Vec<u8> {
        projection_key(MEMBER_KIND, &self.entity_id, &self.id)
    }
}

pub struct MemberRegistry {
    entity_id: Id,
    store: Arc<dyn KvStore>,
    members: RwLock<HashMap<Id, Member>>,
}

impl MemberRegistry {
    pub fn new(entity_id: Id, store: Arc<dyn KvStore>) -> Self {
        MemberRegistry {
            entity_id,
            store,
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Alive members ordered by ID
    pub fn members(&self) -> Vec<Member> {
        let mut out: Vec<Member> = self
            .members
            .read()
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.id);
        out
    }

    pub fn get(&self, id: &Id) -> Option<Member> {
        self.members.read().get(id).cloned()
    }

    pub fn is_member(&self, id: &Id) -> bool {
        self.members
            .read()
            .get(id)
            .map_or(false, |m| m.status == MemberStatus::Alive)
    }
}

impl OplogHandler for MemberRegistry {
    fn category(&self) -> OplogCategory {
        OplogCategory::Member
    }

    fn apply(&self, obj_id: &Id, chain: &[&Oplog]) -> StrandResult<()> {
        let Some(head) = chain.last() else {
            return Ok(());
        };
        let status = match head.op {
            Op::AddMember => MemberStatus::Alive,
            Op::DeleteMember => MemberStatus::Deleted,
            op => {
                return Err(StrandError::InvalidOp {
                    op,
                    category: OplogCategory::Member,
                })
            }
        };

        let member = Member {
            id: *obj_id,
            entity_id: self.entity_id,
            status,
            log_id: head.id,
            update_ts: head.create_ts,
        };
        member.save(self.store.as_ref(), false)?;
        self.members.write().insert(*obj_id, member);
        Ok(())
    }

    fn reload(&self) -> StrandResult<()> {
        let stored: Vec<Member> = scan_json(self.store.as_ref(), &projection_prefix(MEMBER_KIND, &self.entity_id))?;
        let mut members = self.members.write();
        members.clear();
        for member in stored {
            members.insert(member.id, member);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_store::MemoryStore;

    #[test]
    fn test_add_then_delete() {
        let registry = MemberRegistry::new(Id::new([1; 32]), Arc::new(MemoryStore::new()));
        let who = Id::new([2; 32]);
        let add = Oplog::new(Id::new([3; 32]), who, Op::AddMember, Id::NIL, Id::NIL, who, Timestamp::from_secs(1));
        let delete = Oplog::new(Id::new([4; 32]), who, Op::DeleteMember, add.id, Id::NIL, who, Timestamp::from_secs(2));

        registry.apply(&who, &[&add]).unwrap();
        assert!(registry.is_member(&who));

        registry.apply(&who, &[&add, &delete]).unwrap();
        assert!(!registry.is_member(&who));
        assert!(registry.members().is_empty());
        assert_eq!(registry.get(&who).unwrap().log_id, delete.id);
    }
}
