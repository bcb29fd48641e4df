//! Entity kinds
//!
//! Entities share `EntityMeta` and differ in their body. They are stored as
//! an `EntityRecord` and decoded back by kind.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_core::{EntityMeta, EntityRecord, EntityStatus, Id, StrandError, StrandResult, Timestamp};
use strand_store::{entity_key, put_json, Durability, KvStore};
use strand_sync::{OplogHandler, ProtocolManager};

pub const BOARD_KIND: &str = "board";
pub const PROFILE_KIND: &str = "profile";

/// Replicated entity with its own oplog history
pub trait Entity: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Kind-specific state
    fn body(&self) -> StrandResult<serde_json::Value>;

    fn clone_box(&self) -> Box<dyn Entity>;

    #[inline]
    fn id(&self) -> Id {
        self.meta().id
    }

    fn set_status(&mut self, status: EntityStatus, ts: Timestamp) {
        let meta = self.meta_mut();
        meta.status = status;
        meta.update_ts = ts;
    }

    fn to_record(&self) -> StrandResult<EntityRecord> {
        Ok(EntityRecord {
            kind: self.kind().to_string(),
            meta: self.meta().clone(),
            body: self.body()?,
        })
    }

    /// Idempotent upsert keyed by entity ID
    fn save(&self, store: &dyn KvStore, is_important: bool) -> StrandResult<()> {
        put_json(
            store,
            &entity_key(&self.id()),
            &self.to_record()?,
            Durability::from_important(is_important),
        )
    }

    /// Bind the entity to its freshly opened protocol manager
    fn init(&mut self, pm: &ProtocolManager) -> StrandResult<()> {
        if pm.entity_id() != self.id() {
            return Err(StrandError::InvalidBundle(format!(
                "protocol manager of {:?} bound to entity {:?}",
                pm.entity_id(),
                self.id()
            )));
        }
        Ok(())
    }

    /// Handlers replacing the protocol manager's defaults
    fn handlers(&self, _store: &Arc<dyn KvStore>) -> Vec<Arc<dyn OplogHandler>> {
        Vec::new()
    }
}

impl Clone for Box<dyn Entity> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardBody {
    pub title: String,
}

/// Shared board of content objects
#[derive(Clone, Debug, PartialEq)]
pub struct Board {
    pub meta: EntityMeta,
    pub body: BoardBody,
}

impl Board {
    pub fn new(meta: EntityMeta, title: impl Into<String>) -> Self {
        Board {
            meta,
            body: BoardBody { title: title.into() },
        }
    }

    pub fn title(&self) -> &str {
        &self.body.title
    }
}

impl Entity for Board {
    fn kind(&self) -> &'static str {
        BOARD_KIND
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn body(&self) -> StrandResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.body)?)
    }

    fn clone_box(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileBody {
    pub display_name: String,
}

/// Public profile of an identity
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub meta: EntityMeta,
    pub body: ProfileBody,
}

impl Profile {
    pub fn new(meta: EntityMeta, display_name: impl Into<String>) -> Self {
        Profile {
            meta,
            body: ProfileBody {
                display_name: display_name.into(),
            },
        }
    }
}

impl Entity for Profile {
    fn kind(&self) -> &'static str {
        PROFILE_KIND
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn body(&self) -> StrandResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.body)?)
    }

    fn clone_box(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
}

/// Rebuild an entity from its stored record
pub fn decode_entity(record: EntityRecord) -> StrandResult<Box<dyn Entity>> {
    let body = record.body;
    match record.kind.as_str() {
        BOARD_KIND => Ok(Box::new(Board {
            meta: record.meta,
            body: decode_body(body)?,
        })),
        PROFILE_KIND => Ok(Box::new(Profile {
            meta: record.meta,
            body: decode_body(body)?,
        })),
        other => Err(StrandError::UnknownEntityKind(other.to_string())),
    }
}

fn decode_body<T: Default + serde::de::DeserializeOwned>(body: serde_json::Value) -> StrandResult<T> {
    if body.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::EntityType;
    use strand_store::{get_json, MemoryStore};

    fn meta() -> EntityMeta {
        EntityMeta::new(Id::new([1; 32]), Id::new([2; 32]), EntityType::Group, Timestamp::from_secs(5))
    }

    #[test]
    fn test_record_roundtrip_by_kind() {
        let board = Board::new(meta(), "plans");
        let decoded = decode_entity(board.to_record().unwrap()).unwrap();
        assert_eq!(decoded.kind(), BOARD_KIND);
        assert_eq!(decoded.body().unwrap(), serde_json::json!({ "title": "plans" }));

        let profile = Profile::new(meta(), "ada");
        let decoded = decode_entity(profile.to_record().unwrap()).unwrap();
        assert_eq!(decoded.kind(), PROFILE_KIND);
    }

    #[test]
    fn test_unknown_kind() {
        let mut record = Board::new(meta(), "x").to_record().unwrap();
        record.kind = "calendar".into();
        assert!(matches!(decode_entity(record), Err(StrandError::UnknownEntityKind(k)) if k == "calendar"));
    }

    #[test]
    fn test_null_body_defaults() {
        let record = EntityRecord {
            kind: BOARD_KIND.into(),
            meta: meta(),
            body: serde_json::Value::Null,
        };
        let board = decode_entity(record).unwrap();
        assert_eq!(board.body().unwrap(), serde_json::json!({ "title": "" }));
    }

    #[test]
    fn test_save_is_keyed_by_id() {
        let store = MemoryStore::new();
        let mut board = Board::new(meta(), "x");
        board.save(&store, false).unwrap();
        board.set_status(EntityStatus::Alive, Timestamp::from_secs(9));
        board.save(&store, true).unwrap();

        let stored: EntityRecord = get_json(&store, &entity_key(&board.id())).unwrap().unwrap();
        assert_eq!(stored.meta.status, EntityStatus::Alive);
        assert_eq!(store.len(), 1);
    }
}
