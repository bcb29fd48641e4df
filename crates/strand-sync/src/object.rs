//! Generic content projection
//!
//! Keeps the head-of-chain body of every content object. Entity kinds that
//! need richer state register their own handler instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use strand_core::{Id, Op, Oplog, OplogCategory, StrandError, StrandResult, Timestamp};
use strand_store::{projection_key, projection_prefix, scan_json, KvStore, Record};

use crate::OplogHandler;

const OBJECT_KIND: &str = "object";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectStatus {
    Alive,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentObject {
    pub id: Id,
    pub entity_id: Id,
    pub creator_id: Id,
    pub status: ObjectStatus,
    /// Payload of the newest create or update on the canonical chain
    pub body: serde_json::Value,
    pub log_id: Id,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
}

impl Record for ContentObject {
    fn storage_key(&self) -> Vec<u8> {
        projection_key(OBJECT_KIND, &self.entity_id, &self.id)
    }
}

pub struct ObjectProjection {
    entity_id: Id,
    store: Arc<dyn KvStore>,
    objects: RwLock<HashMap<Id, ContentObject>>,
}

impl ObjectProjection {
    pub fn new(entity_id: Id, store: Arc<dyn KvStore>) -> Self {
        ObjectProjection {
            entity_id,
            store,
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &Id) -> Option<ContentObject> {
        self.objects.read().get(id).cloned()
    }

    /// Live objects ordered by creation
    pub fn objects(&self) -> Vec<ContentObject> {
        let mut out: Vec<ContentObject> = self
            .objects
            .read()
            .values()
            .filter(|o| o.status == ObjectStatus::Alive)
            .cloned()
            .collect();
        out.sort_by_key(|o| (o.create_ts, o.id));
        out
    }
}

impl OplogHandler for ObjectProjection {
    fn category(&self) -> OplogCategory {
        OplogCategory::Content
    }

    fn validate(&self, log: &Oplog) -> StrandResult<()> {
        let misplaced = match log.op {
            Op::CreateObject => !log.is_root(),
            Op::UpdateObject | Op::DeleteObject => log.is_root(),
            _ => false,
        };
        if misplaced {
            return Err(StrandError::BrokenChain(log.id));
        }
        if matches!(log.op, Op::CreateObject | Op::UpdateObject) {
            log.extra_as::<serde_json::Value>()?;
        }
        Ok(())
    }

    fn apply(&self, obj_id: &Id, chain: &[&Oplog]) -> StrandResult<()> {
        let (Some(root), Some(head)) = (chain.first(), chain.last()) else {
            return Ok(());
        };

        let mut body = serde_json::Value::Null;
        let mut status = ObjectStatus::Alive;
        for log in chain {
            match log.op {
                Op::CreateObject | Op::UpdateObject => body = log.extra_as()?,
                Op::DeleteObject => status = ObjectStatus::Deleted,
                op => {
                    return Err(StrandError::InvalidOp {
                        op,
                        category: OplogCategory::Content,
                    })
                }
            }
        }

        let object = ContentObject {
            id: *obj_id,
            entity_id: self.entity_id,
            creator_id: root.creator_id,
            status,
            body,
            log_id: head.id,
            create_ts: root.create_ts,
            update_ts: head.create_ts,
        };
        object.save(self.store.as_ref(), false)?;
        self.objects.write().insert(*obj_id, object);
        Ok(())
    }

    fn reload(&self) -> StrandResult<()> {
        let stored: Vec<ContentObject> = scan_json(self.store.as_ref(), &projection_prefix(OBJECT_KIND, &self.entity_id))?;
        let mut objects = self.objects.write();
        objects.clear();
        for object in stored {
            objects.insert(object.id, object);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_store::MemoryStore;

    fn log(b: u8, op: Op, pre: Id, secs: i64, body: &str) -> Oplog {
        Oplog::new(Id::new([b; 32]), Id::new([9; 32]), op, pre, Id::NIL, Id::new([8; 32]), Timestamp::from_secs(secs))
            .with_extra(&body)
            .unwrap()
    }

    #[test]
    fn test_head_body_wins() {
        let projection = ObjectProjection::new(Id::new([1; 32]), Arc::new(MemoryStore::new()));
        let create = log(2, Op::CreateObject, Id::NIL, 1, "draft");
        let update = log(3, Op::UpdateObject, create.id, 2, "final");

        projection.apply(&create.obj_id, &[&create, &update]).unwrap();
        let object = projection.get(&create.obj_id).unwrap();
        assert_eq!(object.body, serde_json::json!("final"));
        assert_eq!(object.log_id, update.id);
        assert_eq!(object.create_ts, Timestamp::from_secs(1));
    }

    #[test]
    fn test_delete_hides_object() {
        let projection = ObjectProjection::new(Id::new([1; 32]), Arc::new(MemoryStore::new()));
        let create = log(2, Op::CreateObject, Id::NIL, 1, "x");
        let delete = log(3, Op::DeleteObject, create.id, 2, "");

        projection.apply(&create.obj_id, &[&create, &delete]).unwrap();
        assert!(projection.objects().is_empty());
        assert_eq!(projection.get(&create.obj_id).unwrap().status, ObjectStatus::Deleted);
    }

    #[test]
    fn test_validate_chain_position() {
        let projection = ObjectProjection::new(Id::new([1; 32]), Arc::new(MemoryStore::new()));
        assert!(projection.validate(&log(2, Op::UpdateObject, Id::NIL, 1, "x")).is_err());
        assert!(projection.validate(&log(2, Op::CreateObject, Id::new([5; 32]), 1, "x")).is_err());
        assert!(projection.validate(&log(2, Op::CreateObject, Id::NIL, 1, "x")).is_ok());
    }

    #[test]
    fn test_validate_rejects_undecodable_body() {
        let projection = ObjectProjection::new(Id::new([1; 32]), Arc::new(MemoryStore::new()));
        let mut create = log(2, Op::CreateObject, Id::NIL, 1, "x");
        create.extra = b"{1: 2}".to_vec();
        assert!(matches!(projection.validate(&create), Err(StrandError::Serialization(_))));

        // Deletes carry no body
        let mut delete = log(3, Op::DeleteObject, create.id, 2, "");
        delete.extra = b"not json".to_vec();
        assert!(projection.validate(&delete).is_ok());
    }
}
