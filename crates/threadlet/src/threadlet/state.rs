//! Threadlet identity, lifecycle states and end states

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a Threadlet
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadletId(u64);

static NEXT_THREADLET_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadletId {
    /// Generate a new unique ThreadletId
    pub fn new() -> Self {
        ThreadletId(NEXT_THREADLET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ThreadletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a task submitted with `run`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a threadlet
///
/// Always returns to `Ready` between tasks; how the last task ended is
/// recorded separately as an [`EndState`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ThreadletState {
    /// Idle, or waiting for its turn
    Ready,
    /// Being stepped by the scheduler
    Running,
    /// Pause requested while running; becomes `Paused` at the end of the slice
    Pausing,
    /// Paused; not scheduled until resumed
    Paused,
    /// Suspended on a contract
    Waiting,
    /// Task finished; settling its contract
    Ending,
    /// Task stopped; settling its contract
    Stopping,
}

/// How the most recent task ended
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum EndState {
    /// Returned normally
    Ended,
    /// Terminated by `stop`
    Stopped,
    /// Threw, or awaited a rejected contract
    Failed,
}

impl fmt::Display for EndState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndState::Ended => "ended",
            EndState::Stopped => "stopped",
            EndState::Failed => "failed",
        };
        f.write_str(s)
    }
}
