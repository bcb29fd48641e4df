//! Op-key derivation and rotation

use hkdf::Hkdf;
use sha2::Sha256;

use strand_core::{Id, StrandError, StrandResult};

use crate::{hash, KEY_SIZE};

/// Content address of an op key
pub fn op_key_hash(key: &[u8; KEY_SIZE]) -> Id {
    Id::new(hash(key))
}

/// Rotating op-key chain for one entity
///
/// Each epoch's key is derived from the previous chain key, so a device
/// holding epoch `n` can compute every later key but none of the earlier
/// ones.
#[derive(Clone)]
pub struct KeyChain {
    chain_key: [u8; KEY_SIZE],
    entity_id: Id,
    epoch: u32,
}

impl KeyChain {
    /// Start a chain from random seed bytes
    pub fn new(seed: &[u8; KEY_SIZE], entity_id: Id) -> StrandResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(entity_id.as_bytes()), seed);
        let mut chain_key = [0u8; KEY_SIZE];
        hkdf.expand(b"STRAND_OPKEY_CHAIN_v0", &mut chain_key)
            .map_err(|_| StrandError::KeyDerivation)?;

        Ok(KeyChain {
            chain_key,
            entity_id,
            epoch: 0,
        })
    }

    /// Op key of the current epoch
    pub fn current_key(&self) -> StrandResult<[u8; KEY_SIZE]> {
        let hkdf = Hkdf::<Sha256>::new(Some(self.entity_id.as_bytes()), &self.chain_key);
        let mut key = [0u8; KEY_SIZE];
        let info = format!("STRAND_OPKEY_{}", self.epoch);
        hkdf.expand(info.as_bytes(), &mut key)
            .map_err(|_| StrandError::KeyDerivation)?;
        Ok(key)
    }

    /// Ratchet forward one epoch
    pub fn advance(&mut self) -> StrandResult<()> {
        let hkdf = Hkdf::<Sha256>::new(Some(&self.epoch.to_le_bytes()), &self.chain_key);
        let mut next = [0u8; KEY_SIZE];
        hkdf.expand(b"STRAND_OPKEY_RATCHET", &mut next)
            .map_err(|_| StrandError::KeyDerivation)?;

        self.chain_key = next;
        self.epoch += 1;
        Ok(())
    }

    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    #[inline]
    pub fn entity_id(&self) -> Id {
        self.entity_id
    }
}

impl std::fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyChain")
            .field("entity_id", &self.entity_id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(b: u8) -> Id {
        Id::new([b; 32])
    }

    #[test]
    fn test_advance_changes_key() {
        let mut chain = KeyChain::new(&[0x42u8; KEY_SIZE], entity(1)).unwrap();

        let k0 = chain.current_key().unwrap();
        chain.advance().unwrap();
        let k1 = chain.current_key().unwrap();

        assert_ne!(k0, k1);
        assert_eq!(chain.epoch(), 1);
    }

    #[test]
    fn test_entity_isolation() {
        let a = KeyChain::new(&[0x42u8; KEY_SIZE], entity(1)).unwrap();
        let b = KeyChain::new(&[0x42u8; KEY_SIZE], entity(2)).unwrap();

        assert_ne!(a.current_key().unwrap(), b.current_key().unwrap());
    }

    #[test]
    fn test_same_seed_same_chain() {
        let mut a = KeyChain::new(&[7u8; KEY_SIZE], entity(1)).unwrap();
        let mut b = KeyChain::new(&[7u8; KEY_SIZE], entity(1)).unwrap();
        for _ in 0..5 {
            a.advance().unwrap();
            b.advance().unwrap();
        }
        assert_eq!(a.current_key().unwrap(), b.current_key().unwrap());
    }

    #[test]
    fn test_key_hash_is_content_address() {
        let key = [9u8; KEY_SIZE];
        assert_eq!(op_key_hash(&key), op_key_hash(&key));
        assert_ne!(op_key_hash(&key), op_key_hash(&[8u8; KEY_SIZE]));
    }
}
