//! PreModify staging for one write operation.
//!
//! A PreModify event for a matching subscription leaves a record here; the
//! Modify event that follows for the same subscription consumes it.

use crate::subscriptions::SubscriptionKey;
use crate::types::EntryId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A subscription waiting for the Modify of `entry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedPreModify {
    pub subscription: SubscriptionKey,
    pub entry: EntryId,
}

static NEXT_WRITE_ID: AtomicU64 = AtomicU64::new(1);

/// The write operation whose committed change is being fanned out.
#[derive(Debug)]
pub struct WriteOperation {
    id: u64,
    staged: Mutex<Vec<StagedPreModify>>,
}

impl WriteOperation {
    pub fn new() -> Self {
        Self {
            id: NEXT_WRITE_ID.fetch_add(1, Ordering::Relaxed),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self, subscription: SubscriptionKey, entry: EntryId) {
        self.staged.lock().push(StagedPreModify { subscription, entry });
    }

    /// Remove and return the record staged for `subscription`, if any.
    pub fn take(&self, subscription: SubscriptionKey) -> Option<StagedPreModify> {
        let mut staged = self.staged.lock();
        let pos = staged.iter().position(|s| s.subscription == subscription)?;
        Some(staged.remove(pos))
    }

    pub fn is_staged(&self, subscription: SubscriptionKey) -> bool {
        self.staged.lock().iter().any(|s| s.subscription == subscription)
    }

    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }
}

impl Default for WriteOperation {
    fn default() -> Self {
        Self::new()
    }
}
