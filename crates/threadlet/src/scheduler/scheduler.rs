//! Dispatch loop, post-yield placement and host-loop helpers

use super::clock::{Clock, MonotonicClock};
use super::queue::ReadyQueues;
use super::timer::DeferredQueue;
use crate::contract::{SealedContract, Settlement};
use crate::diagnostics;
use crate::error::{SchedulerError, SchedulerResult};
use crate::threadlet::runner::{SliceOutcome, ThreadletCore};
use crate::threadlet::{Controls, ThreadletId};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Scheduler construction parameters
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Controls used by threadlets that do not specify their own
    pub default_controls: Controls,
    /// Time source for timeslices and deferred requeues
    pub clock: Arc<dyn Clock>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_controls: Controls::default(),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl SchedulerConfig {
    /// Use a different clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use different default controls
    pub fn with_default_controls(mut self, controls: Controls) -> Self {
        self.default_controls = controls;
        self
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("default_controls", &self.default_controls)
            .finish_non_exhaustive()
    }
}

/// Cumulative dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Slices run
    pub dispatches: u64,
    /// Yields that went straight back to the run queue
    pub fast_requeues: u64,
    /// Yields parked until their yield interval elapsed
    pub deferrals: u64,
    /// Yields sent to the back of their priority queue
    pub demotions: u64,
    /// Promotion passes over the priority queues
    pub promotions: u64,
    /// Slices that ended waiting on a contract or paused
    pub suspensions: u64,
    /// Tasks that ended, stopped or failed inside a slice
    pub completions: u64,
}

/// Point-in-time view of the queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Threadlet in the dispatch slot
    pub running: Option<ThreadletId>,
    /// Length of the run queue
    pub run_queue: usize,
    /// Lengths of the High, Default and Low queues
    pub priority: [usize; 3],
    /// Threadlets queued or running
    pub n_threads: usize,
    /// Pending deferred requeues (may include stale entries)
    pub deferred: usize,
}

/// Result of a single [`Scheduler::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// One threadlet was stepped
    Dispatched(ThreadletId),
    /// Nothing was ready; `next_deadline` is the earliest deferred requeue
    Idle {
        /// Earliest deferred requeue, on the scheduler's clock
        next_deadline: Option<Duration>,
    },
}

/// Where a yielded threadlet goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Run queue; work timer keeps running
    RunQueue,
    /// Off the queues until the delay elapses, then its priority queue
    Defer(Duration),
    /// Back of its priority queue
    Demote,
}

/// Classify a yield by the work time accumulated since the timer started
pub(crate) fn classify(work: Duration, controls: &Controls) -> Placement {
    if work < controls.timeslice {
        Placement::RunQueue
    } else if work < controls.yield_interval {
        Placement::Defer(controls.yield_interval - work)
    } else {
        Placement::Demote
    }
}

struct SchedulerState {
    queues: ReadyQueues<Arc<ThreadletCore>>,
    deferred: DeferredQueue<(Arc<ThreadletCore>, u64)>,
    running: Option<Arc<ThreadletCore>>,
    stats: SchedulerStats,
}

struct Shared {
    state: Mutex<SchedulerState>,
    clock: Arc<dyn Clock>,
    default_controls: Controls,
    dispatching: AtomicBool,
    shut_down: AtomicBool,
}

/// Releases the dispatch slot on every exit path
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a cooperative scheduler
///
/// Clones share the same queues.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Non-owning handle held by threadlets
#[derive(Clone)]
pub(crate) struct WeakScheduler {
    shared: Weak<Shared>,
}

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.shared.upgrade().map(|shared| Scheduler { shared })
    }
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    queues: ReadyQueues::new(),
                    deferred: DeferredQueue::new(),
                    running: None,
                    stats: SchedulerStats::default(),
                }),
                clock: config.clock,
                default_controls: config.default_controls,
                dispatching: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Get the scheduler's clock
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Get the controls used for threadlets created with defaults
    pub fn default_controls(&self) -> Controls {
        self.shared.default_controls
    }

    /// Check whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Fire due deferred requeues, then step the next ready threadlet
    ///
    /// Fails with [`SchedulerError::Busy`] when called from inside a task or
    /// while another thread is dispatching.
    pub fn tick(&self) -> SchedulerResult<Tick> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        if self
            .shared
            .dispatching
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(SchedulerError::Busy);
        }
        let _guard = DispatchGuard(&self.shared.dispatching);

        let now = self.shared.clock.now();
        let due = self.shared.state.lock().deferred.pop_due(now);
        let woken: Vec<Arc<ThreadletCore>> = due
            .into_iter()
            .filter(|(core, epoch)| core.wake_deferred(*epoch))
            .map(|(core, _)| core)
            .collect();

        let next = {
            let mut state = self.shared.state.lock();
            for core in woken {
                let priority = core.controls().priority;
                state.queues.push_priority(core, priority);
            }
            match state.queues.pop() {
                Some((core, passes)) => {
                    state.stats.promotions += passes as u64;
                    state.stats.dispatches += 1;
                    state.running = Some(core.clone());
                    Some(core)
                }
                None => None,
            }
        };

        let Some(core) = next else {
            let next_deadline = self.shared.state.lock().deferred.next_deadline();
            return Ok(Tick::Idle { next_deadline });
        };

        tracing::trace!(threadlet = %core.id(), name = core.name(), "dispatch");
        let outcome = core.run_slice(self.shared.clock.as_ref());
        self.settle_dispatch(&core, outcome);
        Ok(Tick::Dispatched(core.id()))
    }

    /// Clear the running slot and place the threadlet per its slice outcome
    fn settle_dispatch(&self, core: &Arc<ThreadletCore>, outcome: SliceOutcome) {
        let placement = match outcome {
            SliceOutcome::Yielded { work } => {
                let placement = classify(work, &core.controls());
                let epoch = core.place(placement);
                Some((placement, epoch))
            }
            _ => None,
        };
        let shut_down = self.is_shut_down();
        let now = self.shared.clock.now();

        let mismatch = {
            let mut state = self.shared.state.lock();
            let was_running = state.running.take();
            let mismatch = !matches!(&was_running, Some(r) if Arc::ptr_eq(r, core));
            let priority = core.controls().priority;
            match outcome {
                SliceOutcome::Yielded { .. } => match placement {
                    Some((Placement::RunQueue, _)) => {
                        state.stats.fast_requeues += 1;
                        if !shut_down {
                            state.queues.push_run(core.clone());
                        }
                    }
                    Some((Placement::Demote, _)) => {
                        state.stats.demotions += 1;
                        if !shut_down {
                            state.queues.push_priority(core.clone(), priority);
                        }
                    }
                    Some((Placement::Defer(delay), epoch)) => {
                        state.stats.deferrals += 1;
                        if !shut_down {
                            state.deferred.push(now + delay, (core.clone(), epoch));
                        }
                    }
                    None => {}
                },
                SliceOutcome::Waiting | SliceOutcome::Paused => state.stats.suspensions += 1,
                SliceOutcome::Ended { more } => {
                    state.stats.completions += 1;
                    if more && !shut_down {
                        state.queues.push_priority(core.clone(), priority);
                    }
                }
                SliceOutcome::Idle => {}
            }
            mismatch
        };

        tracing::debug!(threadlet = %core.id(), ?outcome, ?placement, "slice settled");
        if mismatch {
            diagnostics::internal(&format!(
                "threadlet {} reported a slice but was not running",
                core.id()
            ));
        }
        if shut_down {
            core.stop();
        }
    }

    /// Queue a threadlet at its native priority. Returns false if the
    /// scheduler no longer accepts work.
    pub(crate) fn enqueue(&self, core: Arc<ThreadletCore>) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let id = core.id();
        let priority = core.controls().priority;
        let duplicate = {
            let mut state = self.shared.state.lock();
            if state.queues.contains_where(|c| c.id() == id) {
                true
            } else {
                state.queues.push_priority(core, priority);
                false
            }
        };
        if duplicate {
            diagnostics::internal(&format!("threadlet {} queued twice", id));
        } else {
            tracing::trace!(threadlet = %id, %priority, "enqueued");
        }
        true
    }

    /// Splice a threadlet out of whichever queue holds it
    pub(crate) fn remove(&self, id: ThreadletId) {
        let removed = self.shared.state.lock().queues.remove_where(|c| c.id() == id);
        if removed.is_some() {
            tracing::trace!(threadlet = %id, "unqueued");
        }
    }

    // =========================================================================
    // Host loops
    // =========================================================================

    /// Dispatch until nothing is queued or deferred, letting the clock run
    /// forward to deferred deadlines. Returns the number of dispatches.
    ///
    /// Threadlets waiting on contracts that nobody settles are not counted
    /// as pending.
    pub fn run_until_idle(&self) -> SchedulerResult<u64> {
        let mut dispatched = 0;
        loop {
            match self.tick()? {
                Tick::Dispatched(_) => dispatched += 1,
                Tick::Idle {
                    next_deadline: Some(deadline),
                } => self.shared.clock.park_until(deadline),
                Tick::Idle {
                    next_deadline: None,
                } => return Ok(dispatched),
            }
        }
    }

    /// Dispatch until `budget` of clock time has passed or nothing is left.
    /// Returns the number of dispatches.
    pub fn run_for(&self, budget: Duration) -> SchedulerResult<u64> {
        let clock = &self.shared.clock;
        let end = clock.now() + budget;
        let mut dispatched = 0;
        while clock.now() < end {
            match self.tick()? {
                Tick::Dispatched(_) => dispatched += 1,
                Tick::Idle {
                    next_deadline: Some(deadline),
                } if deadline < end => clock.park_until(deadline),
                Tick::Idle { .. } => break,
            }
        }
        Ok(dispatched)
    }

    /// Dispatch until `contract` settles or `limit` of wall time passes
    ///
    /// When nothing is ready the calling thread blocks on the contract, so
    /// settlements from other threads are picked up promptly. Returns `None`
    /// on timeout.
    pub fn run_until_settled(
        &self,
        contract: &SealedContract,
        limit: Duration,
    ) -> SchedulerResult<Option<Settlement>> {
        let started = Instant::now();
        loop {
            if let Some(settlement) = contract.settlement() {
                return Ok(Some(settlement));
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Ok(None);
            }
            match self.tick()? {
                Tick::Dispatched(_) => {}
                Tick::Idle {
                    next_deadline: Some(deadline),
                } => self.shared.clock.park_until(deadline),
                Tick::Idle {
                    next_deadline: None,
                } => {
                    let wait = (limit - elapsed).min(Duration::from_millis(1));
                    contract.wait_timeout(wait);
                }
            }
        }
    }

    // =========================================================================
    // Introspection and lifecycle
    // =========================================================================

    /// Get a point-in-time view of the queues
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.shared.state.lock();
        SchedulerSnapshot {
            running: state.running.as_ref().map(|c| c.id()),
            run_queue: state.queues.run_len(),
            priority: state.queues.level_lens(),
            n_threads: state.queues.len() + usize::from(state.running.is_some()),
            deferred: state.deferred.len(),
        }
    }

    /// Get the cumulative dispatch counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared.state.lock().stats
    }

    /// Stop accepting work and stop every known threadlet's active task
    ///
    /// Tasks submitted afterwards are rejected. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let (queued, deferred, running) = {
            let mut state = self.shared.state.lock();
            let queued = state.queues.drain();
            let deferred = state.deferred.drain();
            (queued, deferred, state.running.clone())
        };
        tracing::info!(
            queued = queued.len(),
            deferred = deferred.len(),
            "scheduler shutting down"
        );
        let cores = queued
            .into_iter()
            .chain(deferred.into_iter().map(|(core, _)| core))
            .chain(running);
        for core in cores {
            core.stop();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("snapshot", &self.snapshot())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
