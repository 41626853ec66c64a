//! Threadlet: cooperative multitasking on a single dispatch slot
//!
//! This crate provides:
//! - **Contracts**: one-shot completion handles with ordered continuations
//!   (`contract` module)
//! - **Threadables**: plain functions, generator functions, generator
//!   instances and constants normalized into resumable step sequences
//!   (`threadable` module)
//! - **Threadlets**: per-owner FIFO task runners with priority, timeslice and
//!   yield-interval controls (`threadlet` module)
//! - **Scheduler**: run queue plus three promoted priority queues, with
//!   deferred requeues on an injected clock (`scheduler` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use threadlet::{Scheduler, Threadable, Threadlet, Value};
//!
//! let scheduler = Scheduler::default();
//! let worker = Threadlet::with_defaults(&scheduler, Some("worker"));
//! let done = worker.run(Threadable::function(|_| Ok(Value::Int(42))), vec![]);
//! scheduler.run_until_idle()?;
//! assert_eq!(done.value(), Some(Value::Int(42)));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Contracts: settle-once completion handles
pub mod contract;

/// Resumable computations and the adapter that normalizes them
pub mod threadable;

/// Threadlets and their control parameters
pub mod threadlet;

/// Cooperative scheduler, queues and clocks
pub mod scheduler;

/// Error types
pub mod error;

/// Dynamic values passed between tasks
pub mod value;

mod diagnostics;

// ============================================================================
// Re-exports
// ============================================================================

pub use contract::{Contract, SealedContract, Settlement};
pub use error::{ConfigError, SchedulerError, SchedulerResult};
pub use scheduler::{
    Clock, ManualClock, MonotonicClock, Scheduler, SchedulerConfig, SchedulerSnapshot,
    SchedulerStats, Tick,
};
pub use threadable::{from_fn, Generator, Outcome, Step, Threadable};
pub use threadlet::{
    millis, Controls, EndState, Priority, TaskId, Threadlet, ThreadletId, ThreadletState,
    DEFAULT_YIELD_INTERVAL,
};
pub use value::Value;
