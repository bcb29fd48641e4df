//! Storage key layout
//!
//! ```text
//! entity/{entity_id}                         entity records
//! oplog/{entity_id}/{category}/{log_id}      oplogs
//! proj/{kind}/{entity_id}/{object_id}        projections (masters, members, op keys, objects)
//! ref/{entity_id}/{name}                     per-entity references (log0, op key, cursors)
//! me/{my_id}                                 identity aggregate
//! ```

use strand_core::{Id, OplogCategory};

pub fn entity_key(entity_id: &Id) -> Vec<u8> {
    format!("entity/{}", entity_id).into_bytes()
}

pub fn entity_prefix() -> Vec<u8> {
    b"entity/".to_vec()
}

pub fn oplog_key(entity_id: &Id, category: OplogCategory, log_id: &Id) -> Vec<u8> {
    format!("oplog/{}/{}/{}", entity_id, category.name(), log_id).into_bytes()
}

pub fn oplog_prefix(entity_id: &Id, category: OplogCategory) -> Vec<u8> {
    format!("oplog/{}/{}/", entity_id, category.name()).into_bytes()
}

pub fn projection_key(kind: &str, entity_id: &Id, object_id: &Id) -> Vec<u8> {
    format!("proj/{}/{}/{}", kind, entity_id, object_id).into_bytes()
}

pub fn projection_prefix(kind: &str, entity_id: &Id) -> Vec<u8> {
    format!("proj/{}/{}/", kind, entity_id).into_bytes()
}

pub fn ref_key(entity_id: &Id, name: &str) -> Vec<u8> {
    format!("ref/{}/{}", entity_id, name).into_bytes()
}

pub fn me_key(my_id: &Id) -> Vec<u8> {
    format!("me/{}", my_id).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oplog_key_under_prefix() {
        let entity = Id::new([1; 32]);
        let log = Id::new([2; 32]);

        let key = oplog_key(&entity, OplogCategory::Master, &log);
        assert!(key.starts_with(&oplog_prefix(&entity, OplogCategory::Master)));
        assert!(!key.starts_with(&oplog_prefix(&entity, OplogCategory::Member)));
    }

    #[test]
    fn test_projection_prefix_separates_entities() {
        let a = Id::new([1; 32]);
        let b = Id::new([3; 32]);
        let obj = Id::new([2; 32]);

        assert!(projection_key("master", &a, &obj).starts_with(&projection_prefix("master", &a)));
        assert!(!projection_key("master", &a, &obj).starts_with(&projection_prefix("master", &b)));
    }
}
