//! Reference-counted advisory locking over block paths.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Process-wide (per [`crate::client::Client`]) map from block path to a
/// positive ref-count. Entries are removed once the count returns to zero,
/// so `is_locked` reflects only currently-held locks.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, u32>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, path: &Path) {
        let mut locks = self.locks.lock();
        *locks.entry(path.to_path_buf()).or_insert(0) += 1;
    }

    pub fn release(&self, path: &Path) {
        let mut locks = self.locks.lock();
        if let Some(count) = locks.get_mut(path) {
            if *count <= 1 {
                locks.remove(path);
            } else {
                *count -= 1;
            }
        }
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.locks.lock().get(path).copied().unwrap_or(0) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_counts_and_releases() {
        let reg = LockRegistry::new();
        let p = PathBuf::from("/tmp/block-a");
        assert!(!reg.is_locked(&p));
        reg.acquire(&p);
        reg.acquire(&p);
        assert!(reg.is_locked(&p));
        reg.release(&p);
        assert!(reg.is_locked(&p));
        reg.release(&p);
        assert!(!reg.is_locked(&p));
    }

    #[test]
    fn release_on_unlocked_path_is_a_no_op() {
        let reg = LockRegistry::new();
        reg.release(&PathBuf::from("/tmp/never-locked"));
    }
}
