use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::VersionedStore;

#[derive(Debug, Clone, PartialEq)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    pub blocking_threads: usize,
    pub strict_durability: bool, // true = fsync every commit, false = OS buffer (faster)
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        // Single core: fsync on every commit would starve request handling.
        if cores <= 1 {
            warn!(cores, "CPU constraint detected, commits are not fsynced");
            Self {
                logical_cores: cores,
                worker_threads: 2, // 1 Compute + 1 I/O
                blocking_threads: 4,
                strict_durability: false,
            }
        } else {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                // Store calls park on per-book locks; leave room for waiters.
                blocking_threads: (cores * 8).min(512),
                strict_durability: true,
            }
        }
    }
}

/// Starts the background checkpoint thread.
/// Rewrites the journal every `every` so replay stays proportional to live data.
pub fn start_checkpoint_thread(store: Arc<VersionedStore>, every: Duration) {
    thread::spawn(move || {
        info!(interval_secs = every.as_secs(), "checkpoint thread started");
        loop {
            thread::sleep(every);

            if let Err(e) = store.checkpoint() {
                warn!(error = %e, "checkpoint failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_core_relaxes_durability() {
        let p = SystemProfile::for_cores(1);
        assert!(!p.strict_durability);
        assert_eq!(p.worker_threads, 2);
    }

    #[test]
    fn multi_core_uses_all_cores() {
        let p = SystemProfile::for_cores(8);
        assert!(p.strict_durability);
        assert_eq!(p.worker_threads, 8);
        assert_eq!(p.blocking_threads, 64);
    }
}
