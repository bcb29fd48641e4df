//! Op-key payload encryption using ChaCha20-Poly1305

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use strand_core::{StrandError, StrandResult};
use strand_time::RandomSource;

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Cipher bound to one op key
///
/// Sealed payloads are `nonce || ciphertext || tag`; the nonce is random per
/// message since many devices encrypt under the same key.
pub struct OpKeyCipher {
    cipher: ChaCha20Poly1305,
}

impl OpKeyCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        OpKeyCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt `plaintext`, binding it to `aad`
    pub fn seal(&self, random: &dyn RandomSource, aad: &[u8], plaintext: &[u8]) -> StrandResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        random.fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| StrandError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a payload produced by [`OpKeyCipher::seal`]
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> StrandResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StrandError::DecryptionFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| StrandError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_time::SeededRandom;

    #[test]
    fn test_seal_open() {
        let cipher = OpKeyCipher::new(&[0x42u8; KEY_SIZE]);
        let random = SeededRandom::new(1);

        let sealed = cipher.seal(&random, b"entity", b"oplogs").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + b"oplogs".len() + TAG_SIZE);
        assert_eq!(cipher.open(b"entity", &sealed).unwrap(), b"oplogs");
    }

    #[test]
    fn test_wrong_key_fails() {
        let random = SeededRandom::new(1);
        let sealed = OpKeyCipher::new(&[0x42u8; KEY_SIZE])
            .seal(&random, b"aad", b"secret")
            .unwrap();

        let result = OpKeyCipher::new(&[0x43u8; KEY_SIZE]).open(b"aad", &sealed);
        assert!(matches!(result, Err(StrandError::DecryptionFailed)));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = OpKeyCipher::new(&[0x42u8; KEY_SIZE]);
        let sealed = cipher.seal(&SeededRandom::new(1), b"correct aad", b"secret").unwrap();

        assert!(cipher.open(b"wrong aad", &sealed).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let cipher = OpKeyCipher::new(&[0x42u8; KEY_SIZE]);
        assert!(cipher.open(b"", &[0u8; NONCE_SIZE]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn test_any_flipped_bit_is_rejected(
            plaintext in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
            position in proptest::prelude::any::<proptest::sample::Index>(),
            bit in 0u8..8,
        ) {
            let cipher = OpKeyCipher::new(&[0x42u8; KEY_SIZE]);
            let mut sealed = cipher.seal(&SeededRandom::new(3), b"entity", &plaintext).unwrap();
            proptest::prop_assert_eq!(cipher.open(b"entity", &sealed).unwrap(), plaintext);

            let i = position.index(sealed.len());
            sealed[i] ^= 1 << bit;
            proptest::prop_assert!(matches!(cipher.open(b"entity", &sealed), Err(StrandError::DecryptionFailed)));
        }
    }

    #[test]
    fn test_nonce_differs_per_message() {
        let cipher = OpKeyCipher::new(&[0x42u8; KEY_SIZE]);
        let random = SeededRandom::new(1);

        let a = cipher.seal(&random, b"", b"same").unwrap();
        let b = cipher.seal(&random, b"", b"same").unwrap();
        assert_ne!(a, b);
    }
}
