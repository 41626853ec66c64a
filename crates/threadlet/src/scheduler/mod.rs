//! Cooperative scheduler
//!
//! A single dispatch slot shared by every threadlet registered with a
//! [`Scheduler`]. The host drives it with [`Scheduler::tick`] or one of the
//! loop helpers; each tick steps exactly one threadlet until it yields,
//! waits, pauses or finishes its task.

mod clock;
mod queue;
#[allow(clippy::module_inception)]
mod scheduler;
mod timer;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerSnapshot, SchedulerStats, Tick};

pub(crate) use scheduler::{Placement, WeakScheduler};
