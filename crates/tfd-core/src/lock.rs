//! Process-wide mutual exclusion for mutating operations.
//!
//! The table maps a fixed-size digest of the key bytes to a held marker.
//! Locks are non-reentrant and non-blocking: a contended `lock` fails
//! immediately with [`Error::AlreadyLocked`] and the caller retries later.
//! No fairness guarantees are made.

use std::collections::HashSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::id::ServableId;
use crate::{MAX_NAME_LEN, MAX_PROJECT_LEN, MAX_TEAM_LEN};

const MAX_KEY_LEN: usize = MAX_TEAM_LEN + MAX_PROJECT_LEN + MAX_NAME_LEN;

type Fingerprint = [u8; 32];

/// In-process lock table keyed by a digest of the key bytes.
#[derive(Debug, Default)]
pub struct Lock {
    state: Mutex<HashSet<Fingerprint>>,
}

impl Lock {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(key: &str) -> Fingerprint {
        Sha256::digest(key.as_bytes()).into()
    }

    fn lock_key(&self, key: &str) -> Result<()> {
        let inserted = self
            .state
            .lock()
            .expect("lock table poisoned")
            .insert(Self::fingerprint(key));
        if inserted {
            Ok(())
        } else {
            Err(Error::AlreadyLocked {
                key: key.to_string(),
            })
        }
    }

    fn unlock_key(&self, key: &str) {
        self.state
            .lock()
            .expect("lock table poisoned")
            .remove(&Self::fingerprint(key));
    }

    /// Locks a servable's `team‖project‖name` key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongKeyLength`] for an empty or oversized key and
    /// [`Error::AlreadyLocked`] when another operation holds it.
    pub fn lock_servable(&self, servable: &ServableId) -> Result<()> {
        let key = format!("{}{}{}", servable.team, servable.project, servable.name);
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::WrongKeyLength { max: MAX_KEY_LEN });
        }
        self.lock_key(&key)
    }

    /// Unlocks a servable key. Idempotent.
    pub fn unlock_servable(&self, servable: &ServableId) {
        let key = format!("{}{}{}", servable.team, servable.project, servable.name);
        self.unlock_key(&key);
    }

    /// Locks a distinguished key such as the reconcile guard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyLocked`] when the key is held.
    pub fn lock_id(&self, id: &str) -> Result<()> {
        self.lock_key(id)
    }

    /// Unlocks a distinguished key. Idempotent.
    pub fn unlock_id(&self, id: &str) {
        self.unlock_key(id);
    }

    /// Non-blocking test whether a distinguished key is held.
    #[must_use]
    pub fn is_locked_id(&self, id: &str) -> bool {
        self.state
            .lock()
            .expect("lock table poisoned")
            .contains(&Self::fingerprint(id))
    }

    /// Locks a servable and returns a guard that unlocks on drop.
    ///
    /// # Errors
    ///
    /// Same contract as [`Lock::lock_servable`].
    pub fn guard_servable<'a>(&'a self, servable: &ServableId) -> Result<ServableGuard<'a>> {
        self.lock_servable(servable)?;
        Ok(ServableGuard {
            lock: self,
            servable: servable.clone(),
        })
    }
}

/// RAII guard releasing a servable lock on drop.
#[derive(Debug)]
pub struct ServableGuard<'a> {
    lock: &'a Lock,
    servable: ServableId,
}

impl Drop for ServableGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_servable(&self.servable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servable() -> ServableId {
        ServableId::new("team", "project", "model").unwrap()
    }

    #[test]
    fn second_lock_fails_until_unlocked() {
        let lock = Lock::new();
        lock.lock_servable(&servable()).unwrap();
        assert!(matches!(
            lock.lock_servable(&servable()),
            Err(Error::AlreadyLocked { .. })
        ));
        lock.unlock_servable(&servable());
        lock.lock_servable(&servable()).unwrap();
    }

    #[test]
    fn unlock_is_idempotent() {
        let lock = Lock::new();
        lock.unlock_servable(&servable());
        lock.lock_servable(&servable()).unwrap();
        lock.unlock_servable(&servable());
        lock.unlock_servable(&servable());
    }

    #[test]
    fn distinguished_keys_are_independent_of_servables() {
        let lock = Lock::new();
        lock.lock_id("ReloadInstancesIfNecessary").unwrap();
        assert!(lock.is_locked_id("ReloadInstancesIfNecessary"));
        lock.lock_servable(&servable()).unwrap();
        lock.unlock_id("ReloadInstancesIfNecessary");
        assert!(!lock.is_locked_id("ReloadInstancesIfNecessary"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = Lock::new();
        {
            let _guard = lock.guard_servable(&servable()).unwrap();
            assert!(lock.lock_servable(&servable()).is_err());
        }
        assert!(lock.lock_servable(&servable()).is_ok());
    }
}
