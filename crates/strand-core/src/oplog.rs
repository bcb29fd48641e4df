//! Oplog definitions
//!
//! An oplog is a signed, chained record of one mutation of one object. Logs
//! of the same object form a singly-linked chain through `pre_log_id`; two
//! logs sharing `(obj_id, pre_log_id)` are a fork.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Id, Op, OplogCategory, StrandResult, Timestamp};

/// One co-signature over an oplog hash
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSign {
    pub id: Id,
    pub sig: Vec<u8>,
}

/// Oplog - the unit of replication
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oplog {
    pub id: Id,
    pub obj_id: Id,
    pub op: Op,
    /// Predecessor in this object's chain, `Id::NIL` at the root
    pub pre_log_id: Id,
    /// Master log that authorized the creator when this log was written
    pub master_log_id: Id,
    pub creator_id: Id,
    pub creator_hash: Vec<u8>,
    pub sig: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub key_extra: Vec<u8>,
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    /// Signature and master reference validated locally
    pub is_sync: bool,
    /// On the canonical branch of its object's chain
    pub is_newer: bool,
    /// Op-specific payload (JSON)
    pub extra: Vec<u8>,
    pub master_signs: Vec<MasterSign>,
}

/// Content covered by the hash and signature
#[derive(Serialize)]
struct SignedContent<'a> {
    id: &'a Id,
    obj_id: &'a Id,
    op: Op,
    pre_log_id: &'a Id,
    master_log_id: &'a Id,
    creator_id: &'a Id,
    create_ts: &'a Timestamp,
    extra: &'a [u8],
}

impl Oplog {
    /// Create an unsigned oplog
    pub fn new(
        id: Id,
        obj_id: Id,
        op: Op,
        pre_log_id: Id,
        master_log_id: Id,
        creator_id: Id,
        ts: Timestamp,
    ) -> Self {
        Oplog {
            id,
            obj_id,
            op,
            pre_log_id,
            master_log_id,
            creator_id,
            creator_hash: Vec::new(),
            sig: Vec::new(),
            pubkey: Vec::new(),
            key_extra: Vec::new(),
            hash: Vec::new(),
            salt: Vec::new(),
            create_ts: ts,
            update_ts: ts,
            is_sync: false,
            is_newer: false,
            extra: Vec::new(),
            master_signs: Vec::new(),
        }
    }

    /// Attach an op-specific payload
    pub fn with_extra<T: Serialize>(mut self, extra: &T) -> StrandResult<Self> {
        self.extra = serde_json::to_vec(extra)?;
        Ok(self)
    }

    /// Decode the op-specific payload
    pub fn extra_as<T: DeserializeOwned>(&self) -> StrandResult<T> {
        Ok(serde_json::from_slice(&self.extra)?)
    }

    #[inline]
    pub fn category(&self) -> OplogCategory {
        self.op.category()
    }

    /// Chain root of its object
    #[inline]
    pub fn is_root(&self) -> bool {
        self.pre_log_id.is_nil()
    }

    /// Root log authorizing itself (the first AddMaster of an entity)
    #[inline]
    pub fn is_self_authorized(&self) -> bool {
        self.master_log_id == self.id
    }

    /// Key identifying the fork slot this log occupies
    #[inline]
    pub fn fork_key(&self) -> (Id, Id) {
        (self.obj_id, self.pre_log_id)
    }

    /// Bytes fed to the hash function: canonical content followed by the salt
    pub fn signable_bytes(&self) -> StrandResult<Vec<u8>> {
        let content = SignedContent {
            id: &self.id,
            obj_id: &self.obj_id,
            op: self.op,
            pre_log_id: &self.pre_log_id,
            master_log_id: &self.master_log_id,
            creator_id: &self.creator_id,
            create_ts: &self.create_ts,
            extra: &self.extra,
        };
        let mut bytes = serde_json::to_vec(&content)?;
        bytes.extend_from_slice(&self.salt);
        Ok(bytes)
    }

    /// Fork tie-break: earliest `create_ts` wins, then smallest hash
    pub fn wins_over(&self, other: &Oplog) -> bool {
        (self.create_ts, &self.hash, &self.id) < (other.create_ts, &other.hash, &other.id)
    }

    /// Has `signer` already co-signed this log?
    pub fn is_signed_by(&self, signer: &Id) -> bool {
        self.master_signs.iter().any(|s| s.id == *signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ADDRESS_SIZE;

    fn id(b: u8) -> Id {
        Id::from_parts(&[b; ADDRESS_SIZE], &[b; ADDRESS_SIZE])
    }

    fn log(b: u8, ts: Timestamp) -> Oplog {
        Oplog::new(id(b), id(100), Op::AddMember, Id::NIL, id(200), id(201), ts)
    }

    #[test]
    fn test_signable_bytes_cover_salt_and_content() {
        let mut a = log(1, Timestamp::from_secs(5));
        let base = a.signable_bytes().unwrap();

        a.salt = vec![1, 2, 3];
        let salted = a.signable_bytes().unwrap();
        assert_ne!(base, salted);
        assert!(salted.ends_with(&[1, 2, 3]));

        // Bookkeeping fields are not covered
        a.is_sync = true;
        a.is_newer = true;
        a.update_ts = Timestamp::from_secs(99);
        assert_eq!(a.signable_bytes().unwrap(), salted);
    }

    #[test]
    fn test_wins_over_earliest_then_hash() {
        let mut early = log(1, Timestamp::from_secs(1));
        let mut late = log(2, Timestamp::from_secs(2));
        early.hash = vec![9];
        late.hash = vec![0];
        assert!(early.wins_over(&late));
        assert!(!late.wins_over(&early));

        late.create_ts = early.create_ts;
        assert!(late.wins_over(&early));
    }

    #[test]
    fn test_extra_roundtrip() {
        let log = log(1, Timestamp::ZERO).with_extra(&vec!["a", "b"]).unwrap();
        let extra: Vec<String> = log.extra_as().unwrap();
        assert_eq!(extra, vec!["a".to_string(), "b".to_string()]);
    }
}
