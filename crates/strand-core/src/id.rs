//! Identity types for STRAND
//!
//! An [`Id`] is 32 bytes: a 16-byte owner part followed by a 16-byte suffix.
//! Identity IDs carry the owner address plus a device-derived suffix, while
//! entity and log IDs carry random bytes plus the creator's owner address, so
//! every entity ID embeds who created it.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Total identifier size
pub const ID_SIZE: usize = 32;

/// Size of each half of an identifier
pub const ADDRESS_SIZE: usize = 16;

/// Generic 32-byte identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// Sentinel marking the root of an oplog chain
    pub const NIL: Id = Id([0u8; ID_SIZE]);

    #[inline]
    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }

    /// Build from an owner part and a suffix
    pub fn from_parts(owner: &[u8; ADDRESS_SIZE], suffix: &[u8; ADDRESS_SIZE]) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        bytes[..ADDRESS_SIZE].copy_from_slice(owner);
        bytes[ADDRESS_SIZE..].copy_from_slice(suffix);
        Id(bytes)
    }

    /// New object/log ID: random prefix followed by the creator's owner part
    pub fn with_creator(random: &[u8; ADDRESS_SIZE], creator: &Id) -> Self {
        Id::from_parts(random, &creator.owner())
    }

    /// First half: the owner address (identity IDs) or random bytes (object IDs)
    pub fn owner(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&self.0[..ADDRESS_SIZE]);
        out
    }

    /// Second half: device suffix (identity IDs) or creator address (object IDs)
    pub fn suffix(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&self.0[ADDRESS_SIZE..]);
        out
    }

    /// Does this object ID embed the given identity as its creator?
    pub fn is_created_by(&self, creator: &Id) -> bool {
        self.suffix() == creator.owner()
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        *self == Id::NIL
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(ID_SIZE * 2);
        for b in self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; ID_SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Id(bytes))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Id({}:{})", &hex[..8], &hex[ADDRESS_SIZE * 2..ADDRESS_SIZE * 2 + 8])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).ok_or_else(|| de::Error::custom(format!("invalid id: {s}")))
    }
}

/// Transport-level node identity (a device endpoint)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ZERO: NodeId = NodeId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        NodeId(u64::from_le_bytes(bytes))
    }

    /// Device suffix used when deriving an identity ID on this node
    pub fn suffix(self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..8].copy_from_slice(&self.to_bytes());
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({:016x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hex_roundtrip() {
        let mut bytes = [0u8; ID_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 * 7;
        }
        let id = Id::new(bytes);
        assert_eq!(Id::from_hex(&id.to_hex()), Some(id));
        assert_eq!(Id::from_hex("zz"), None);
    }

    #[test]
    fn test_object_id_embeds_creator() {
        let creator = Id::from_parts(&[0xAB; ADDRESS_SIZE], &NodeId::new(9).suffix());
        let object = Id::with_creator(&[0x01; ADDRESS_SIZE], &creator);

        assert!(object.is_created_by(&creator));
        assert_eq!(object.suffix(), creator.owner());
        assert!(!creator.is_created_by(&object));
    }

    #[test]
    fn test_id_serde_as_hex() {
        let id = Id::from_parts(&[1; ADDRESS_SIZE], &[2; ADDRESS_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_nil() {
        assert!(Id::NIL.is_nil());
        assert!(!Id::from_parts(&[1; ADDRESS_SIZE], &[0; ADDRESS_SIZE]).is_nil());
    }

    proptest::proptest! {
        #[test]
        fn test_object_ids_trace_back_to_creator(
            owner in proptest::prelude::any::<[u8; ADDRESS_SIZE]>(),
            suffix in proptest::prelude::any::<[u8; ADDRESS_SIZE]>(),
            random in proptest::prelude::any::<[u8; ADDRESS_SIZE]>(),
        ) {
            let creator = Id::from_parts(&owner, &suffix);
            let object = Id::with_creator(&random, &creator);
            proptest::prop_assert_eq!(creator.owner(), owner);
            proptest::prop_assert_eq!(creator.suffix(), suffix);
            proptest::prop_assert!(object.is_created_by(&creator));
            proptest::prop_assert_eq!(Id::from_hex(&object.to_hex()), Some(object));
        }
    }
}
