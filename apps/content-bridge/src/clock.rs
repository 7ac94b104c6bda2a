use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Time source for the supervisor. Timer deadlines are computed from
/// [`Clock::now`]; heartbeat payloads carry [`Clock::epoch_millis`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn epoch_millis(&self) -> u64;
}

/// Reads tokio's clock so paused-time tests and the async driver agree on
/// when a deadline has passed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn epoch_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Hand-advanced clock for deterministic state machine tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    origin_epoch_ms: u64,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            origin_epoch_ms: 1_700_000_000_000,
            elapsed: Mutex::new(Duration::ZERO),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn epoch_millis(&self) -> u64 {
        self.origin_epoch_ms + self.elapsed.lock().as_millis() as u64
    }
}
