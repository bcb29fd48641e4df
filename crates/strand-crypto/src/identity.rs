//! Identity management using Ed25519

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use strand_core::{Id, NodeId, StrandError, StrandResult, ADDRESS_SIZE};
use strand_time::RandomSource;

use crate::KEY_SIZE;

/// SHA-256 of arbitrary bytes
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Owner address of a public key (first 16 bytes of its SHA-256)
pub fn owner_address(pubkey: &[u8; 32]) -> [u8; ADDRESS_SIZE] {
    let digest = hash(pubkey);
    let mut out = [0u8; ADDRESS_SIZE];
    out.copy_from_slice(&digest[..ADDRESS_SIZE]);
    out
}

/// Signing identity
///
/// All devices of one logical identity share the secret key and the suffix,
/// so they sign as the same `Id`; devices are told apart by `NodeId`.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    id: Id,
}

impl Identity {
    /// Generate a new identity whose ID suffix is derived from `node`
    pub fn generate(random: &dyn RandomSource, node: NodeId) -> Self {
        Self::from_bytes(&random.bytes32(), node.suffix())
    }

    /// Restore an identity from its secret key bytes and ID suffix
    pub fn from_bytes(secret: &[u8; 32], suffix: [u8; ADDRESS_SIZE]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        let id = Id::from_parts(&owner_address(verifying_key.as_bytes()), &suffix);

        Identity {
            signing_key,
            verifying_key,
            id,
        }
    }

    /// Get the signing key bytes (secret)
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the verifying key bytes (public)
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.verifying_key.verify(message, &sig).is_ok()
    }

    /// Symmetric key shared by every device of this identity
    ///
    /// Seals identity-level history exchanged between those devices.
    pub fn device_key(&self) -> StrandResult<[u8; KEY_SIZE]> {
        let hkdf = Hkdf::<Sha256>::new(Some(self.id.as_bytes()), &self.signing_key.to_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(b"STRAND_DEVICE_KEY_v0", &mut key)
            .map_err(|_| StrandError::KeyDerivation)?;
        Ok(key)
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            verifying_key: self.verifying_key,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Public identity for verification only
#[derive(Clone)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
}

impl PublicIdentity {
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes).ok()?;
        Some(PublicIdentity { verifying_key })
    }

    /// Owner part every ID signed by this key must carry
    pub fn owner(&self) -> [u8; ADDRESS_SIZE] {
        owner_address(self.verifying_key.as_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.verifying_key.verify(message, &sig).is_ok()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("owner", &self.owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_time::SeededRandom;

    #[test]
    fn test_identity_generation() {
        let random = SeededRandom::new(1);
        let id1 = Identity::generate(&random, NodeId::new(1));
        let id2 = Identity::generate(&random, NodeId::new(1));

        assert_ne!(id1.id(), id2.id());
        assert_eq!(id1.id().suffix(), NodeId::new(1).suffix());
    }

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate(&SeededRandom::new(2), NodeId::new(7));
        let message = b"strand oplog";

        let signature = identity.sign(message);
        assert!(identity.verify(message, &signature));
        assert!(!identity.verify(b"Wrong message", &signature));
    }

    #[test]
    fn test_public_identity_owner_matches_id() {
        let identity = Identity::generate(&SeededRandom::new(3), NodeId::new(7));
        let public = PublicIdentity::from_bytes(&identity.verifying_key_bytes()).unwrap();

        assert_eq!(public.owner(), identity.id().owner());

        let signature = identity.sign(b"payload");
        assert!(public.verify(b"payload", &signature));
    }

    #[test]
    fn test_identity_roundtrip_across_devices() {
        let identity = Identity::generate(&SeededRandom::new(4), NodeId::new(1));
        let restored = Identity::from_bytes(&identity.signing_key_bytes(), identity.id().suffix());

        assert_eq!(identity.id(), restored.id());
    }

    #[test]
    fn test_device_key_shared_by_devices_only() {
        let random = SeededRandom::new(5);
        let identity = Identity::generate(&random, NodeId::new(1));
        let device = Identity::from_bytes(&identity.signing_key_bytes(), identity.id().suffix());
        let other = Identity::generate(&random, NodeId::new(1));

        assert_eq!(identity.device_key().unwrap(), device.device_key().unwrap());
        assert_ne!(identity.device_key().unwrap(), other.device_key().unwrap());
    }
}
