//! In-process mutual exclusion over activity streams.
//!
//! A stream is either held or free; there is no owner token and no expiry
//! beyond the release performed by the coordinator. The lock table is an
//! instance, not a process global, so every engine (and every test) gets its
//! own.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::types::StreamId;

pub struct StreamLock {
    held: Mutex<HashSet<StreamId>>,
    /// Delay before a failed batch is released in full.
    grace: Duration,
}

impl StreamLock {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(HashSet::new()),
            grace,
        })
    }

    fn table(&self) -> MutexGuard<'_, HashSet<StreamId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `id` held. Returns false, without side effects, if it already is.
    pub fn hold(&self, id: &str) -> bool {
        self.table().insert(id.to_string())
    }

    /// Clear the held flag. Idempotent.
    pub fn release(&self, id: &str) -> bool {
        self.table().remove(id);
        true
    }

    /// Try to hold every stream in `ids`, iterating the list in reverse.
    ///
    /// Members that were acquired stay held even when another member fails;
    /// there is no instantaneous rollback. When the batch fails, the whole
    /// batch (including members held by someone else) is released once the
    /// grace period has elapsed.
    pub fn hold_batch(self: &Arc<Self>, ids: &[StreamId]) -> bool {
        let mut all = true;
        {
            let mut table = self.table();
            for id in ids.iter().rev() {
                if !table.insert(id.clone()) {
                    all = false;
                }
            }
        }

        if !all {
            self.schedule_release(ids.to_vec());
        }
        all
    }

    /// Release every member of `ids` unconditionally.
    pub fn release_batch(&self, ids: &[StreamId]) -> bool {
        let mut table = self.table();
        for id in ids {
            table.remove(id);
        }
        true
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.table().contains(id)
    }

    pub fn held_count(&self) -> usize {
        self.table().len()
    }

    fn schedule_release(self: &Arc<Self>, ids: Vec<StreamId>) {
        let lock = Arc::clone(self);
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    tracing::debug!(streams = ids.len(), "releasing failed lock batch");
                    lock.release_batch(&ids);
                });
            }
            // Without a runtime there is nothing to defer onto.
            Err(_) => {
                lock.release_batch(&ids);
            }
        }
    }
}

/// A successfully held batch, released when dropped.
pub struct HeldStreams {
    lock: Arc<StreamLock>,
    ids: Vec<StreamId>,
    released: bool,
}

impl HeldStreams {
    /// Hold `ids` as one batch, or `None` if any member is unavailable.
    pub fn acquire(lock: &Arc<StreamLock>, ids: Vec<StreamId>) -> Option<Self> {
        if lock.hold_batch(&ids) {
            Some(Self {
                lock: Arc::clone(lock),
                ids,
                released: false,
            })
        } else {
            None
        }
    }

    pub fn ids(&self) -> &[StreamId] {
        &self.ids
    }

    pub fn release(&mut self) {
        if !self.released {
            self.lock.release_batch(&self.ids);
            self.released = true;
        }
    }
}

impl Drop for HeldStreams {
    fn drop(&mut self) {
        self.release();
    }
}
