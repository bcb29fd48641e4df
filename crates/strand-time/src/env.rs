//! Strategy bundle passed through constructors

use std::sync::Arc;

use strand_core::{Id, Timestamp};

use crate::{Clock, FixedSalt, ManualClock, OsRandom, OsSalt, RandomSource, SaltSource, SeededRandom, SystemClock};

/// Clock, salt and randomness used by one node
#[derive(Clone)]
pub struct Env {
    pub clock: Arc<dyn Clock>,
    pub salt: Arc<dyn SaltSource>,
    pub random: Arc<dyn RandomSource>,
}

impl Env {
    /// Real clock and OS randomness
    pub fn system() -> Self {
        Env {
            clock: Arc::new(SystemClock::new()),
            salt: Arc::new(OsSalt),
            random: Arc::new(OsRandom),
        }
    }

    /// Fully reproducible environment
    pub fn deterministic(start: Timestamp, seed: u64) -> Self {
        Env {
            clock: Arc::new(ManualClock::new(start)),
            salt: Arc::new(FixedSalt::default()),
            random: Arc::new(SeededRandom::new(seed)),
        }
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Fresh object or log ID created by `creator`
    pub fn new_id(&self, creator: &Id) -> Id {
        Id::with_creator(&self.random.bytes16(), creator)
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ADDRESS_SIZE;

    #[test]
    fn test_deterministic_env_reproducible() {
        let creator = Id::from_parts(&[3; ADDRESS_SIZE], &[0; ADDRESS_SIZE]);
        let a = Env::deterministic(Timestamp::from_secs(1), 7);
        let b = Env::deterministic(Timestamp::from_secs(1), 7);

        assert_eq!(a.new_id(&creator), b.new_id(&creator));
        assert_eq!(a.now(), b.now());
        assert!(a.new_id(&creator).is_created_by(&creator));
    }
}
