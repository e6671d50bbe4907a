use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::model::BookId;

/// Per-book mutual exclusion with bounded waits.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<BookId>>,
    released: Condvar,
}

/// Releases the book on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    id: BookId,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries up to `attempts` times, waiting at most `timeout` each time.
    pub fn acquire(&self, id: BookId, timeout: Duration, attempts: u32) -> StoreResult<KeyGuard<'_>> {
        let attempts = attempts.max(1);
        let mut held = self.held.lock().map_err(|_| StoreError::Poisoned("key locks"))?;

        for attempt in 1..=attempts {
            let (guard, wait) = self
                .released
                .wait_timeout_while(held, timeout, |h| h.contains(&id))
                .map_err(|_| StoreError::Poisoned("key locks"))?;
            held = guard;

            if !held.contains(&id) {
                held.insert(id);
                return Ok(KeyGuard { locks: self, id });
            }
            if wait.timed_out() {
                debug!(id, attempt, "book lock wait timed out");
            }
        }

        Err(StoreError::ConcurrentModification { id, attempts })
    }

    pub fn is_held(&self, id: BookId) -> bool {
        self.held.lock().map(|h| h.contains(&id)).unwrap_or(false)
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // A poisoned set still has to forget the id or the book stays locked forever.
        let mut held = match self.locks.held.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.id);
        drop(held);
        self.locks.released.notify_all();
    }
}
