//! Named cluster-wide locks built on conditional writes.
//!
//! Locks come in two modes. An exclusive lock has a single owner; a shared
//! lock may have any number of owners, each with its own expiry. The two
//! modes never coexist on the same name. There is no queuing: a caller that
//! gets `LockOutcome::Contended` simply tries again later.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::{Storage, StorageError, StoredLock};

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock.
    Acquired,
    /// Someone else holds the lock in a conflicting mode.
    Contended,
    /// The conditional write could not be performed.
    StorageError(StorageError),
}

impl LockOutcome {
    /// Whether the lock was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HeldLock {
    name: String,
    owner: String,
    mode: LockMode,
}

/// Acquires and releases named locks, remembering the ones it holds.
pub struct LockManager<S: Storage> {
    storage: Arc<S>,
    held: Mutex<HashSet<HeldLock>>,
}

impl<S: Storage> LockManager<S> {
    /// Create a lock manager over shared storage.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            held: Mutex::new(HashSet::new()),
        }
    }

    fn track(&self, name: &str, owner: &str, mode: LockMode) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(HeldLock {
            name: name.to_string(),
            owner: owner.to_string(),
            mode,
        });
    }

    fn untrack(&self, name: &str, owner: &str, mode: LockMode) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&HeldLock {
            name: name.to_string(),
            owner: owner.to_string(),
            mode,
        });
    }

    /// Take `name` exclusively for `owner`.
    ///
    /// Succeeds only if the lock has no other exclusive owner and no live
    /// shared owners. Re-acquiring a lock `owner` already holds succeeds.
    pub async fn acquire_exclusive_lock(&self, name: &str, owner: &str) -> LockOutcome {
        match self.storage.try_lock_exclusive(name, owner).await {
            Ok(true) => {
                self.track(name, owner, LockMode::Exclusive);
                tracing::debug!(lock = %name, owner = %owner, "Acquired exclusive lock");
                LockOutcome::Acquired
            }
            Ok(false) => {
                tracing::debug!(lock = %name, owner = %owner, "Exclusive lock is held elsewhere");
                LockOutcome::Contended
            }
            Err(e) => {
                tracing::warn!(lock = %name, owner = %owner, error = %e, "Failed to acquire exclusive lock");
                LockOutcome::StorageError(e)
            }
        }
    }

    /// Add `owner` to the shared owners of `name` for `ttl`.
    ///
    /// Calling again before expiry renews the entry.
    pub async fn acquire_shared_lock(&self, name: &str, owner: &str, ttl: Duration) -> LockOutcome {
        match self.storage.try_lock_shared(name, owner, ttl).await {
            Ok(true) => {
                self.track(name, owner, LockMode::Shared);
                tracing::debug!(lock = %name, owner = %owner, ttl = ?ttl, "Acquired shared lock");
                LockOutcome::Acquired
            }
            Ok(false) => {
                tracing::debug!(lock = %name, owner = %owner, "Shared lock blocked by exclusive owner");
                LockOutcome::Contended
            }
            Err(e) => {
                tracing::warn!(lock = %name, owner = %owner, error = %e, "Failed to acquire shared lock");
                LockOutcome::StorageError(e)
            }
        }
    }

    /// Remove `owner` from the shared owners of `name`.
    ///
    /// Returns `false` when `owner` was not a live shared owner.
    pub async fn release_shared_lock(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        let released = self.storage.unlock_shared(name, owner).await?;
        self.untrack(name, owner, LockMode::Shared);
        Ok(released)
    }

    /// Give up exclusive ownership of `name`.
    ///
    /// Returns `false` when `owner` did not hold the lock.
    pub async fn release_exclusive_lock(
        &self,
        name: &str,
        owner: &str,
    ) -> Result<bool, StorageError> {
        let released = self.storage.unlock_exclusive(name, owner).await?;
        self.untrack(name, owner, LockMode::Exclusive);
        Ok(released)
    }

    /// Inspect a lock.
    pub async fn lock_state(&self, name: &str) -> Result<Option<StoredLock>, StorageError> {
        self.storage.get_lock(name).await
    }

    /// Number of locks this manager believes it holds.
    pub fn held_count(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or(0)
    }

    /// Release every lock acquired through this manager.
    ///
    /// Failures are logged; the remaining locks are still attempted.
    pub async fn release_all(&self) -> usize {
        let held: Vec<HeldLock> = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            held.drain().collect()
        };

        let mut released = 0;
        for lock in held {
            let result = match lock.mode {
                LockMode::Exclusive => self.storage.unlock_exclusive(&lock.name, &lock.owner).await,
                LockMode::Shared => self.storage.unlock_shared(&lock.name, &lock.owner).await,
            };
            match result {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(lock = %lock.name, owner = %lock.owner, error = %e, "Failed to release lock");
                }
            }
        }
        released
    }
}
