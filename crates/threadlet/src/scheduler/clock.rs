//! Host clock abstraction
//!
//! The scheduler needs two things from its host: elapsed-time measurement
//! and a way to let time pass until the next deferred requeue is due.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic clock consumed by the scheduler
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;

    /// Let time pass until `deadline` (relative to the same origin)
    fn park_until(&self, deadline: Duration);
}

/// Wall clock backed by [`Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn park_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Manually advanced clock for tests and simulations
///
/// Time only moves through [`advance`](ManualClock::advance) or when the
/// scheduler parks until a deadline.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn park_until(&self, deadline: Duration) {
        let mut now = self.now.lock();
        if deadline > *now {
            *now = deadline;
        }
    }
}
