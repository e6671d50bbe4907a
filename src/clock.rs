use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in microseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    pub fn set(&self, ts: u64) {
        self.now.store(ts, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: u64) -> u64 {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_micros(&self) -> u64 {
        (**self).now_micros()
    }
}

/// Shared timestamp source. Strictly increasing across calls, even when the wall clock
/// stalls or goes backwards.
pub struct TimeSource {
    clock: Box<dyn Clock>,
    floor: AtomicU64,
}

impl TimeSource {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            floor: AtomicU64::new(0),
        }
    }

    /// One reading per logical mutation.
    pub fn now(&self) -> u64 {
        let reading = self.clock.now_micros();
        let next = |floor: u64| reading.max(floor.saturating_add(1));
        match self.floor.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |floor| Some(next(floor))) {
            Ok(prev) | Err(prev) => next(prev),
        }
    }

    /// Raise the floor to a timestamp already on disk.
    pub fn observe(&self, ts: u64) {
        self.floor.fetch_max(ts, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSource")
            .field("floor", &self.floor.load(Ordering::SeqCst))
            .finish()
    }
}
