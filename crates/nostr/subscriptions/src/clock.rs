//! Time source for timeouts, retry backoff and event timestamps.
//!
//! Production code uses [`SystemClock`], which goes through `tokio::time` and
//! therefore honours `tokio::time::pause`. [`ManualClock`] never sleeps: it
//! jumps forward by the requested delay and remembers every sleep, so backoff
//! schedules can be asserted exactly.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall clock, unix seconds.
    fn unix_timestamp(&self) -> u64;

    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn unix_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Deterministic clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    unix_origin: u64,
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(1_700_000_000)
    }

    /// Start the wall clock at `unix_seconds`.
    pub fn starting_at(unix_seconds: u64) -> Self {
        Self {
            origin: Instant::now(),
            unix_origin: unix_seconds,
            state: Arc::new(Mutex::new(ManualState {
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.state.lock().offset += duration;
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().offset
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().offset
    }

    fn unix_timestamp(&self) -> u64 {
        self.unix_origin + self.state.lock().offset.as_secs()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let mut state = self.state.lock();
        state.offset += duration;
        state.sleeps.push(duration);
        Box::pin(async {})
    }
}
