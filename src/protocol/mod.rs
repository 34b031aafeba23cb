//! Latency exchange protocol
//!
//! The pinger (publisher side) drives each payload size through
//! `Warmup -> Measuring -> Draining -> Done`; the ponger (subscriber side)
//! echoes pings, acknowledges end-of-size markers and tracks throughput.
//! Each role runs on a single task: channel events and timer ticks are both
//! consumed there, so protocol state needs no locking.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod pacing;
pub mod pinger;
pub mod ponger;

pub use pacing::PublicationPacer;
pub use pinger::{Pinger, PingerOutcome};
pub use ponger::{Ponger, PongerOutcome};

/// Control markers are repeated this many times in best-effort mode.
pub const BEST_EFFORT_CONTROL_REPEATS: usize = 30;

/// Consecutive send failures after which the run is aborted.
pub const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 10;

/// Per-size phase of the pinger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Warmup,
    Measuring,
    Draining,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Warmup => write!(f, "WARMUP"),
            Phase::Measuring => write!(f, "MEASURING"),
            Phase::Draining => write!(f, "DRAINING"),
            Phase::Done => write!(f, "DONE"),
        }
    }
}

/// Source of send and receive timestamps, in microseconds.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        crate::utils::current_timestamp_us()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_us)))
    }

    pub fn advance(&self, delta_us: u64) {
        self.0.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn set(&self, now_us: u64) {
        self.0.store(now_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::new(100);
        let handle = clock.clone();
        handle.advance(25);
        assert_eq!(clock.now_us(), 125);
        handle.set(10);
        assert_eq!(clock.now_us(), 10);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        // 2020-01-01 in microseconds.
        assert!(SystemClock.now_us() > 1_577_836_800_000_000);
    }
}
