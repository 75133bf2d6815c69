//! Striped per-uid locking.
//!
//! A fixed table of mutexes indexed by the hash of the uid's byte sequence.
//! All mutations of one document serialize on its stripe; different uids
//! proceed in parallel unless they collide. Acquisition allocates nothing.

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};

const DEFAULT_STRIPES: usize = 1024;

/// A striped lock table keyed by byte sequences.
#[derive(Debug)]
pub struct KeyedLock {
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl KeyedLock {
    /// Create a table with the default stripe count.
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    /// Create a table with `stripes` mutexes (rounded up to a power of two).
    pub fn with_stripes(stripes: usize) -> Self {
        let count = stripes.next_power_of_two().max(1);
        let stripes = (0..count).map(|_| Mutex::new(())).collect::<Vec<_>>();
        KeyedLock {
            stripes: stripes.into_boxed_slice(),
            hasher: RandomState::new(),
        }
    }

    /// Block until the stripe for `key` is held, returning a guard that
    /// releases on drop.
    pub fn acquire(&self, key: &[u8]) -> KeyedLockGuard<'_> {
        let index = self.stripe_index(key);
        KeyedLockGuard {
            _guard: self.stripes[index].lock(),
        }
    }

    fn stripe_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.stripes.len() - 1)
    }
}

impl Default for KeyedLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one stripe of a [`KeyedLock`].
#[derive(Debug)]
pub struct KeyedLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}
