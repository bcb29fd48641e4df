//! Entity metadata shared by every entity kind

use serde::{Deserialize, Serialize};

use crate::{Id, Timestamp};

/// Lifecycle status of an entity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Known but not yet admitted
    #[default]
    Init,
    /// Admitted, history still arriving
    Syncing,
    Alive,
    /// Ownership moved to another identity
    Migrated,
    /// Tombstoned; history is kept for devices that still need it
    Deleted,
}

impl EntityStatus {
    #[inline]
    pub fn is_alive(self) -> bool {
        self == EntityStatus::Alive
    }
}

/// Visibility class of an entity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityType {
    /// Owned by one identity, shared only across its devices
    #[default]
    Private,
    Group,
    /// The identity's own profile
    Personal,
}

/// Pending-sync marker on an entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub log_id: Id,
    pub status: EntityStatus,
    pub update_ts: Timestamp,
}

/// Attributes common to every entity kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: Id,
    pub creator_id: Id,
    pub updater_id: Id,
    pub status: EntityStatus,
    pub entity_type: EntityType,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    pub join_ts: Timestamp,
    pub me_log_ts: Timestamp,
    pub me_log_id: Id,
    pub sync_info: Option<SyncInfo>,
}

impl EntityMeta {
    pub fn new(id: Id, creator_id: Id, entity_type: EntityType, ts: Timestamp) -> Self {
        EntityMeta {
            id,
            creator_id,
            updater_id: creator_id,
            status: EntityStatus::Init,
            entity_type,
            create_ts: ts,
            update_ts: ts,
            join_ts: Timestamp::ZERO,
            me_log_ts: Timestamp::ZERO,
            me_log_id: Id::NIL,
            sync_info: None,
        }
    }
}

/// Serialized form of any entity kind
///
/// `kind` stays a string so records written by newer kinds still load and
/// fail at decode time instead of at deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: String,
    pub meta: EntityMeta,
    /// Kind-specific attributes
    #[serde(default)]
    pub body: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ADDRESS_SIZE;

    #[test]
    fn test_new_meta_defaults() {
        let creator = Id::from_parts(&[7; ADDRESS_SIZE], &[0; ADDRESS_SIZE]);
        let id = Id::with_creator(&[1; ADDRESS_SIZE], &creator);
        let meta = EntityMeta::new(id, creator, EntityType::Group, Timestamp::from_secs(3));

        assert_eq!(meta.status, EntityStatus::Init);
        assert_eq!(meta.updater_id, creator);
        assert!(meta.me_log_id.is_nil());
        assert!(meta.sync_info.is_none());
        assert!(!meta.status.is_alive());
    }

    #[test]
    fn test_record_without_body() {
        let creator = Id::from_parts(&[7; ADDRESS_SIZE], &[0; ADDRESS_SIZE]);
        let meta = EntityMeta::new(creator, creator, EntityType::Private, Timestamp::ZERO);
        let mut json = serde_json::to_value(EntityRecord {
            kind: "board".into(),
            meta,
            body: serde_json::Value::Null,
        })
        .unwrap();
        json.as_object_mut().unwrap().remove("body");

        let record: EntityRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.kind, "board");
        assert!(record.body.is_null());
    }
}
