//! Salt and randomness sources

use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

/// Salt size mixed into every oplog hash
pub const SALT_SIZE: usize = 32;

/// Source of per-oplog salt
pub trait SaltSource: Send + Sync {
    fn salt(&self) -> [u8; SALT_SIZE];
}

/// Source of random bytes for IDs and keys
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);

    fn bytes16(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.fill(&mut out);
        out
    }

    fn bytes32(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.fill(&mut out);
        out
    }
}

/// OS-backed salt
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSalt;

impl SaltSource for OsSalt {
    fn salt(&self) -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}

/// OS-backed randomness
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// Constant salt for reproducible hashes in tests
#[derive(Debug, Clone, Copy)]
pub struct FixedSalt(pub [u8; SALT_SIZE]);

impl Default for FixedSalt {
    fn default() -> Self {
        // ASCII "0123456789" repeated
        let mut salt = [0u8; SALT_SIZE];
        for (i, b) in salt.iter_mut().enumerate() {
            *b = b'0' + (i % 10) as u8;
        }
        FixedSalt(salt)
    }
}

impl SaltSource for FixedSalt {
    fn salt(&self) -> [u8; SALT_SIZE] {
        self.0
    }
}

/// Seeded PRNG for reproducible IDs in tests
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        SeededRandom {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill(&self, buf: &mut [u8]) {
        self.rng.lock().fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_random_reproducible() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        assert_eq!(a.bytes32(), b.bytes32());
        assert_ne!(a.bytes16(), a.bytes16());
    }

    #[test]
    fn test_os_salt_differs() {
        assert_ne!(OsSalt.salt(), OsSalt.salt());
    }

    #[test]
    fn test_fixed_salt_is_ascii_digits() {
        let salt = FixedSalt::default().salt();
        assert_eq!(&salt[..10], b"0123456789");
        assert_eq!(FixedSalt::default().salt(), salt);
    }
}
