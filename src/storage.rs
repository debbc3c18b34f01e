//! Storage collaborator: entry lookup under a transient locker.
//!
//! A [`Locker`] is a token drawn from a finite per-process [`LockerPool`].
//! It is returned to the pool when dropped, so any early return out of a
//! dispatch releases it.

use crate::types::{Dn, Entry};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Deadlock detected")]
    Deadlock,

    #[error("Lock not granted")]
    LockNotGranted,

    #[error("Lock unavailable")]
    LockUnavailable,

    #[error("Storage failure: {0}")]
    Other(String),
}

/// How the dispatcher treats a storage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the acquisition.
    Retryable,
    /// Give up and report the server as busy.
    Busy,
    /// Give up with an internal error.
    Fatal,
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Deadlock | StorageError::LockNotGranted => ErrorClass::Retryable,
            StorageError::LockUnavailable => ErrorClass::Busy,
            StorageError::Other(_) => ErrorClass::Fatal,
        }
    }
}

struct PoolState {
    free: Vec<u32>,
    capacity: usize,
}

/// Finite pool of locker identifiers.
pub struct LockerPool {
    state: Mutex<PoolState>,
}

impl LockerPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let free = (1..=capacity as u32).rev().collect();
        Arc::new(Self {
            state: Mutex::new(PoolState { free, capacity }),
        })
    }

    /// Take a locker, or `LockUnavailable` if the pool is exhausted.
    pub fn acquire(self: &Arc<Self>) -> Result<Locker, StorageError> {
        let id = self
            .state
            .lock()
            .free
            .pop()
            .ok_or(StorageError::LockUnavailable)?;
        Ok(Locker {
            id,
            pool: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        state.capacity - state.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    fn release(&self, id: u32) {
        self.state.lock().free.push(id);
    }
}

/// A held locker; released on drop.
pub struct Locker {
    id: u32,
    pool: Arc<LockerPool>,
}

impl Locker {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Debug for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locker({})", self.id)
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Result of resolving a DN.
#[derive(Debug, Clone, Default)]
pub struct DnLookup {
    /// The entry, if found.
    pub entry: Option<Arc<Entry>>,
    /// Closest existing ancestor when the entry is missing.
    pub matched: Option<Arc<Entry>>,
}

/// Result of following an alias.
#[derive(Debug, Clone)]
pub enum AliasTarget {
    /// The alias resolved to this entry.
    Resolved(Arc<Entry>),
    /// The target does not exist; `matched` is its closest ancestor.
    Missing { matched: Option<Arc<Entry>> },
    /// The alias chain loops back on itself.
    Loop,
}

/// Storage engine as seen by the dispatcher.
pub trait Directory: Send + Sync {
    /// Obtain a transient locker for the lookups of one dispatch.
    fn acquire_locker(&self) -> Result<Locker, StorageError>;

    /// Resolve a normalized DN under the given locker.
    fn entry_by_dn(&self, locker: &Locker, dn: &Dn) -> Result<DnLookup, StorageError>;

    /// Follow an alias entry to its target.
    fn deref_alias(&self, locker: &Locker, alias: &Entry) -> Result<AliasTarget, StorageError>;

    /// True if `dn` is one of the backend's naming contexts.
    fn is_suffix(&self, dn: &Dn) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_release() {
        let pool = LockerPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.acquire().unwrap_err(), StorageError::LockUnavailable);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(StorageError::Deadlock.class(), ErrorClass::Retryable);
        assert_eq!(StorageError::LockNotGranted.class(), ErrorClass::Retryable);
        assert_eq!(StorageError::LockUnavailable.class(), ErrorClass::Busy);
        assert_eq!(StorageError::Other("disk".into()).class(), ErrorClass::Fatal);
    }
}
