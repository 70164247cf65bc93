//! Time source abstraction
//!
//! The schema and maintenance rules ask a [`Clock`] for "now" instead of
//! reading the system clock directly, so tests can pin and advance time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the epoch
    fn now(&self) -> Timestamp;
}

/// The real system clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// A clock that only moves when told to
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
