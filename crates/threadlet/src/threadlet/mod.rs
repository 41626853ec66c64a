//! Threadlets: independently scheduled, sequentially ordered task runners
//!
//! A [`Threadlet`] owns a FIFO of submitted tasks and runs them one at a time
//! on its scheduler. Tasks on the same threadlet settle in submission order;
//! tasks on different threadlets interleave according to each threadlet's
//! [`Controls`].

mod controls;
pub(crate) mod runner;
mod state;

pub use controls::{millis, Controls, Priority, DEFAULT_YIELD_INTERVAL};
pub use state::{EndState, TaskId, ThreadletId, ThreadletState};

use self::runner::ThreadletCore;
use crate::contract::{Contract, SealedContract};
use crate::error::ConfigError;
use crate::scheduler::Scheduler;
use crate::threadable::Threadable;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Handle to a threadlet
///
/// Dropping the handle stops the threadlet: the active task settles as
/// stopped and queued tasks are discarded.
pub struct Threadlet {
    core: Arc<ThreadletCore>,
}

impl Threadlet {
    /// Create a threadlet on `scheduler`
    pub fn new(scheduler: &Scheduler, name: Option<&str>, controls: Controls) -> Self {
        let core = ThreadletCore::new(name, controls, scheduler.downgrade());
        tracing::debug!(
            threadlet = %core.id(),
            name = core.name(),
            priority = %controls.priority,
            "threadlet created"
        );
        Self { core }
    }

    /// Create a threadlet with the scheduler's default controls
    pub fn with_defaults(scheduler: &Scheduler, name: Option<&str>) -> Self {
        Self::new(scheduler, name, scheduler.default_controls())
    }

    /// Create a threadlet from a loosely typed controls object
    ///
    /// Validation failures are returned before anything is created.
    pub fn from_config(
        scheduler: &Scheduler,
        name: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<Self, ConfigError> {
        let controls = Controls::from_json(config, scheduler.default_controls())?;
        Ok(Self::new(scheduler, name, controls))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Submit a task; it starts once every earlier task has settled
    pub fn run(&self, threadable: impl Into<Threadable>, args: Vec<Value>) -> SealedContract {
        self.core.run(threadable.into(), args)
    }

    /// Bind `threadable` to this threadlet as a reusable submitter
    ///
    /// Once the threadlet is dropped the submitter returns rejected contracts.
    pub fn bind_run(
        &self,
        threadable: impl Into<Threadable>,
    ) -> impl Fn(Vec<Value>) -> SealedContract + Send + Sync + 'static {
        let threadable = threadable.into();
        let core = Arc::downgrade(&self.core);
        move |args| match core.upgrade() {
            Some(core) => core.run(threadable.clone(), args),
            None => Contract::rejected("threadlet has been dropped").sealed(),
        }
    }

    /// Stop the active task at its next suspension point and discard
    /// tasks that have not started
    pub fn stop(&self) -> &Self {
        self.core.stop();
        self
    }

    /// Stop scheduling this threadlet; the active task keeps its call stack
    pub fn pause(&self) -> &Self {
        self.core.pause();
        self
    }

    /// Undo [`pause`](Self::pause)
    pub fn resume(&self) -> &Self {
        self.core.resume();
        self
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Get the threadlet ID
    pub fn id(&self) -> ThreadletId {
        self.core.id()
    }

    /// Get the threadlet name
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Get the control parameters
    pub fn controls(&self) -> Controls {
        self.core.controls()
    }

    /// Get the lifecycle state
    pub fn state(&self) -> ThreadletState {
        self.core.state()
    }

    /// Get how the most recent task ended
    pub fn end_state(&self) -> Option<EndState> {
        self.core.end_state()
    }

    /// Get the value (or rejection reason) the most recent task ended with
    pub fn end_value(&self) -> Value {
        self.core.end_value()
    }

    /// Check whether the threadlet is ready (idle or waiting for its turn)
    pub fn is_ready(&self) -> bool {
        self.state() == ThreadletState::Ready
    }

    /// Check whether the threadlet is in the dispatch slot
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ThreadletState::Running | ThreadletState::Pausing
        )
    }

    /// Check whether the threadlet is paused (or will be at the end of the
    /// current slice)
    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    /// Check whether the active task is waiting on a contract
    pub fn is_waiting(&self) -> bool {
        self.state() == ThreadletState::Waiting
    }

    /// Check whether there is no active or queued task
    pub fn is_idle(&self) -> bool {
        self.core.is_idle()
    }

    /// Check whether the most recent task returned normally
    pub fn has_ended(&self) -> bool {
        self.end_state() == Some(EndState::Ended)
    }

    /// Check whether the most recent task failed
    pub fn has_failed(&self) -> bool {
        self.end_state() == Some(EndState::Failed)
    }

    /// Check whether the most recent task was stopped
    pub fn has_stopped(&self) -> bool {
        self.end_state() == Some(EndState::Stopped)
    }

    /// Get the number of tasks submitted but not started
    pub fn pending_tasks(&self) -> usize {
        self.core.pending_tasks()
    }

    /// Get the number of suspended callers in the active task
    pub fn call_depth(&self) -> usize {
        self.core.call_depth()
    }

    /// Get the number of slices this threadlet has run
    pub fn dispatch_count(&self) -> u64 {
        self.core.dispatch_count()
    }
}

impl Drop for Threadlet {
    fn drop(&mut self) {
        self.core.stop();
    }
}

impl fmt::Debug for Threadlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Threadlet")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("end_state", &self.end_state())
            .finish()
    }
}
