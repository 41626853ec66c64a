//! Threadlet internals: task queue, call stack and the stepping loop.
//!
//! Locking rule: the threadlet mutex is never held while user code runs
//! (computations, generator factories, contract handlers) and never while
//! the scheduler's own lock is taken. Every method that needs both releases
//! one before taking the other.

use super::controls::Controls;
use super::state::{EndState, TaskId, ThreadletId, ThreadletState};
use crate::contract::{Contract, SealedContract, Settlement};
use crate::diagnostics;
use crate::scheduler::{Clock, Placement, WeakScheduler};
use crate::threadable::{panic_value, Advance, CallStack, Input, Threadable};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Where the scheduler currently holds this threadlet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Not known to the scheduler
    Idle,
    /// In the run queue or a priority queue
    Queued,
    /// In the running slot
    Running,
    /// Waiting for a deferred requeue
    Deferred,
}

/// What happened during one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceOutcome {
    /// Voluntary yield or timeslice boundary; `work` is the accumulated work time
    Yielded { work: Duration },
    /// Suspended on a contract
    Waiting,
    /// Paused during the slice
    Paused,
    /// The task ended; `more` if another task is ready to start
    Ended { more: bool },
    /// Nothing was run
    Idle,
}

/// Why the stepping loop stopped
enum SliceEnd {
    Yielded(Input),
    Preempted(Input),
    Await {
        contract: SealedContract,
        returned: bool,
    },
    Finished(Value),
    Failed(Value),
}

struct QueuedTask {
    id: TaskId,
    threadable: Threadable,
    args: Vec<Value>,
    contract: Contract,
}

enum Body {
    /// Not dispatched yet; instantiated on first dispatch
    Pending(Threadable, Vec<Value>),
    Started(CallStack),
    /// Taken out by the stepping loop
    InSlice,
}

struct ActiveTask {
    id: TaskId,
    contract: Contract,
    body: Body,
    /// How to feed the next resume
    input: Input,
}

struct Inner {
    state: ThreadletState,
    end_state: Option<EndState>,
    end_value: Value,
    slot: Slot,
    paused: bool,
    stop_requested: bool,
    /// Bumped whenever outstanding wake-ups (contract waits, deferred
    /// requeues) must be ignored
    epoch: u64,
    /// Start of the current work-timer period
    work_started: Option<Duration>,
    current: Option<ActiveTask>,
    queue: VecDeque<QueuedTask>,
    /// Tasks discarded by a stop that arrived mid-slice; settled after the
    /// running task so settlement order stays submission order
    backlog: Vec<Contract>,
}

pub(crate) struct ThreadletCore {
    id: ThreadletId,
    name: String,
    controls: Controls,
    scheduler: WeakScheduler,
    inner: Mutex<Inner>,
    dispatches: AtomicU64,
}

/// Promote the head of the queue to the active task if nothing is active
fn start_next(inner: &mut Inner) {
    if inner.current.is_some() || inner.paused {
        return;
    }
    if let Some(task) = inner.queue.pop_front() {
        inner.stop_requested = false;
        inner.current = Some(ActiveTask {
            id: task.id,
            contract: task.contract,
            body: Body::Pending(task.threadable, task.args),
            input: Input::Resume(Value::Undefined),
        });
    }
}

/// Mark the threadlet as queued if it has runnable work and the scheduler
/// does not hold it. Returns true if the caller must enqueue it.
fn claim_slot(inner: &mut Inner) -> bool {
    if inner.slot == Slot::Idle
        && inner.current.is_some()
        && !inner.paused
        && inner.state != ThreadletState::Waiting
    {
        inner.slot = Slot::Queued;
        inner.state = ThreadletState::Ready;
        true
    } else {
        false
    }
}

impl ThreadletCore {
    pub(crate) fn new(name: Option<&str>, controls: Controls, scheduler: WeakScheduler) -> Arc<Self> {
        let id = ThreadletId::new();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("threadlet-{}", id));
        Arc::new(Self {
            id,
            name,
            controls,
            scheduler,
            inner: Mutex::new(Inner {
                state: ThreadletState::Ready,
                end_state: None,
                end_value: Value::Undefined,
                slot: Slot::Idle,
                paused: false,
                stop_requested: false,
                epoch: 0,
                work_started: None,
                current: None,
                queue: VecDeque::new(),
                backlog: Vec::new(),
            }),
            dispatches: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub(crate) fn id(&self) -> ThreadletId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn controls(&self) -> Controls {
        self.controls
    }

    pub(crate) fn state(&self) -> ThreadletState {
        self.inner.lock().state
    }

    pub(crate) fn end_state(&self) -> Option<EndState> {
        self.inner.lock().end_state
    }

    pub(crate) fn end_value(&self) -> Value {
        self.inner.lock().end_value.clone()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// True if no task is active or queued
    pub(crate) fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.current.is_none() && inner.queue.is_empty()
    }

    /// Tasks submitted but not started
    pub(crate) fn pending_tasks(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Suspended callers of the active computation
    pub(crate) fn call_depth(&self) -> usize {
        match &self.inner.lock().current {
            Some(ActiveTask {
                body: Body::Started(stack),
                ..
            }) => stack.depth(),
            _ => 0,
        }
    }

    pub(crate) fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Owner operations
    // =========================================================================

    /// Queue a task behind any already queued
    pub(crate) fn run(self: &Arc<Self>, threadable: Threadable, args: Vec<Value>) -> SealedContract {
        let contract = Contract::new();
        let sealed = contract.sealed();
        let id = TaskId::new();
        let schedule = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(QueuedTask {
                id,
                threadable,
                args,
                contract,
            });
            start_next(&mut inner);
            claim_slot(&mut inner)
        };
        tracing::trace!(threadlet = %self.id, task = id.as_u64(), "task submitted");
        if schedule {
            self.enqueue();
        }
        sealed
    }

    /// Stop the active task cooperatively and discard queued ones
    pub(crate) fn stop(self: &Arc<Self>) {
        let (end_current, unqueue, discarded) = {
            let mut inner = self.inner.lock();
            let queued: Vec<Contract> = inner.queue.drain(..).map(|t| t.contract).collect();
            inner.epoch += 1;
            if inner.current.is_none() {
                (false, false, queued)
            } else {
                match inner.slot {
                    Slot::Running => {
                        inner.stop_requested = true;
                        inner.backlog.extend(queued);
                        (false, false, Vec::new())
                    }
                    Slot::Queued => {
                        inner.slot = Slot::Idle;
                        (true, true, queued)
                    }
                    Slot::Deferred | Slot::Idle => {
                        inner.slot = Slot::Idle;
                        (true, false, queued)
                    }
                }
            }
        };
        tracing::debug!(threadlet = %self.id, discarded = discarded.len(), "stop requested");

        if unqueue {
            self.unschedule();
        }
        if end_current {
            self.finish(EndState::Stopped, Ok(Value::Undefined));
        }
        for contract in discarded {
            contract.resolve(Value::Undefined);
        }
        if end_current {
            self.claim_and_enqueue();
        }
    }

    /// Freeze scheduling without discarding the call stack
    pub(crate) fn pause(self: &Arc<Self>) {
        let unqueue = {
            let mut inner = self.inner.lock();
            if inner.paused {
                return;
            }
            inner.paused = true;
            match inner.slot {
                Slot::Queued => {
                    inner.slot = Slot::Idle;
                    inner.state = ThreadletState::Paused;
                    inner.work_started = None;
                    true
                }
                Slot::Deferred => {
                    inner.slot = Slot::Idle;
                    inner.state = ThreadletState::Paused;
                    inner.work_started = None;
                    inner.epoch += 1;
                    false
                }
                Slot::Running => {
                    inner.state = ThreadletState::Pausing;
                    false
                }
                Slot::Idle => {
                    if inner.state != ThreadletState::Waiting {
                        inner.state = ThreadletState::Paused;
                    }
                    false
                }
            }
        };
        tracing::debug!(threadlet = %self.id, "paused");
        if unqueue {
            self.unschedule();
        }
    }

    /// Undo `pause`, re-entering the scheduler if there is work
    pub(crate) fn resume(self: &Arc<Self>) {
        let schedule = {
            let mut inner = self.inner.lock();
            if !inner.paused {
                return;
            }
            inner.paused = false;
            match inner.state {
                ThreadletState::Pausing => inner.state = ThreadletState::Running,
                ThreadletState::Paused => inner.state = ThreadletState::Ready,
                _ => {}
            }
            start_next(&mut inner);
            claim_slot(&mut inner)
        };
        tracing::debug!(threadlet = %self.id, "resumed");
        if schedule {
            self.enqueue();
        }
    }

    // =========================================================================
    // Scheduler-facing operations
    // =========================================================================

    /// Step the active computation until a suspension point
    pub(crate) fn run_slice(self: &Arc<Self>, clock: &dyn Clock) -> SliceOutcome {
        let slice_start = clock.now();
        let (body, input) = {
            let mut inner = self.inner.lock();
            if inner.slot != Slot::Queued {
                let slot = inner.slot;
                drop(inner);
                diagnostics::internal(&format!(
                    "threadlet {} dispatched while {:?}",
                    self.id, slot
                ));
                return SliceOutcome::Idle;
            }
            inner.slot = Slot::Running;
            if inner.stop_requested {
                drop(inner);
                return self.end_in_dispatch(EndState::Stopped, Ok(Value::Undefined));
            }
            if inner.work_started.is_none() {
                inner.work_started = Some(slice_start);
            }
            inner.state = ThreadletState::Running;
            match inner.current.as_mut() {
                Some(task) => (
                    std::mem::replace(&mut task.body, Body::InSlice),
                    std::mem::replace(&mut task.input, Input::Resume(Value::Undefined)),
                ),
                None => {
                    inner.slot = Slot::Idle;
                    inner.state = ThreadletState::Ready;
                    drop(inner);
                    diagnostics::internal(&format!("threadlet {} dispatched without a task", self.id));
                    return SliceOutcome::Idle;
                }
            }
        };
        self.dispatches.fetch_add(1, Ordering::Relaxed);

        let mut stack = match body {
            Body::Started(stack) => stack,
            Body::Pending(threadable, args) => {
                match panic::catch_unwind(AssertUnwindSafe(|| threadable.instantiate(args))) {
                    Ok(root) => CallStack::new(root),
                    Err(payload) => {
                        return self.end_in_dispatch(EndState::Failed, Err(panic_value(payload)))
                    }
                }
            }
            Body::InSlice => {
                diagnostics::internal(&format!("threadlet {} dispatched re-entrantly", self.id));
                return SliceOutcome::Idle;
            }
        };

        let timeslice = self.controls.timeslice;
        let mut next = input;
        let end = loop {
            match stack.step(next) {
                Ok(Advance::Continue(v)) => {
                    next = Input::Resume(v);
                    if clock.now().saturating_sub(slice_start) >= timeslice {
                        break SliceEnd::Preempted(next);
                    }
                }
                Ok(Advance::Yield(v)) => break SliceEnd::Yielded(Input::Resume(v)),
                Ok(Advance::Await { contract, returned }) => {
                    break SliceEnd::Await { contract, returned }
                }
                Ok(Advance::Finished(v)) => break SliceEnd::Finished(v),
                Err(e) => break SliceEnd::Failed(e),
            }
        };

        match end {
            SliceEnd::Yielded(input) => self.suspend_for_yield(stack, input, clock.now()),
            SliceEnd::Preempted(input) => {
                tracing::trace!(threadlet = %self.id, "timeslice exhausted");
                self.suspend_for_yield(stack, input, clock.now())
            }
            SliceEnd::Await { contract, returned } => self.suspend_for_wait(stack, contract, returned),
            SliceEnd::Finished(value) => {
                let stopped = self.inner.lock().stop_requested;
                if stopped {
                    self.end_in_dispatch(EndState::Stopped, Ok(Value::Undefined))
                } else {
                    self.end_in_dispatch(EndState::Ended, Ok(value))
                }
            }
            SliceEnd::Failed(reason) => {
                tracing::debug!(threadlet = %self.id, %reason, "task failed");
                self.end_in_dispatch(EndState::Failed, Err(reason))
            }
        }
    }

    /// Record where the scheduler put a yielded threadlet.
    /// Returns the epoch a deferred requeue must present to fire.
    pub(crate) fn place(&self, placement: Placement) -> u64 {
        let mut inner = self.inner.lock();
        if inner.slot != Slot::Running {
            let slot = inner.slot;
            drop(inner);
            diagnostics::internal(&format!("threadlet {} placed while {:?}", self.id, slot));
            return 0;
        }
        match placement {
            Placement::RunQueue => inner.slot = Slot::Queued,
            Placement::Demote => {
                inner.slot = Slot::Queued;
                inner.work_started = None;
            }
            Placement::Defer(_) => {
                inner.slot = Slot::Deferred;
                inner.work_started = None;
                inner.epoch += 1;
            }
        }
        inner.epoch
    }

    /// Deferred requeue fired. Returns true if the caller must enqueue.
    pub(crate) fn wake_deferred(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.slot == Slot::Deferred && inner.epoch == epoch {
            inner.slot = Slot::Queued;
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn suspend_for_yield(self: &Arc<Self>, stack: CallStack, input: Input, now: Duration) -> SliceOutcome {
        let mut inner = self.inner.lock();
        if inner.stop_requested {
            drop(inner);
            drop(stack);
            return self.end_in_dispatch(EndState::Stopped, Ok(Value::Undefined));
        }
        match inner.current.as_mut() {
            Some(task) => {
                task.body = Body::Started(stack);
                task.input = input;
            }
            None => {
                inner.slot = Slot::Idle;
                drop(inner);
                diagnostics::internal(&format!("threadlet {} lost its task mid-slice", self.id));
                return SliceOutcome::Idle;
            }
        }
        if inner.paused {
            inner.state = ThreadletState::Paused;
            inner.slot = Slot::Idle;
            inner.work_started = None;
            return SliceOutcome::Paused;
        }
        inner.state = ThreadletState::Ready;
        let work = now.saturating_sub(inner.work_started.unwrap_or(now));
        SliceOutcome::Yielded { work }
    }

    fn suspend_for_wait(
        self: &Arc<Self>,
        stack: CallStack,
        contract: SealedContract,
        returned: bool,
    ) -> SliceOutcome {
        let epoch = {
            let mut inner = self.inner.lock();
            if inner.stop_requested {
                drop(inner);
                drop(stack);
                return self.end_in_dispatch(EndState::Stopped, Ok(Value::Undefined));
            }
            match inner.current.as_mut() {
                Some(task) => task.body = Body::Started(stack),
                None => {
                    inner.slot = Slot::Idle;
                    drop(inner);
                    diagnostics::internal(&format!("threadlet {} lost its task mid-slice", self.id));
                    return SliceOutcome::Idle;
                }
            }
            inner.state = ThreadletState::Waiting;
            inner.slot = Slot::Idle;
            inner.work_started = None;
            inner.epoch += 1;
            inner.epoch
        };
        tracing::trace!(threadlet = %self.id, "waiting on contract");

        // May fire immediately if the contract already settled
        let weak = Arc::downgrade(self);
        contract.on_settle(move |settlement| {
            if let Some(core) = weak.upgrade() {
                core.wake(epoch, returned, settlement.clone());
            }
        });
        SliceOutcome::Waiting
    }

    /// Awaited contract settled
    fn wake(self: &Arc<Self>, epoch: u64, returned: bool, settlement: Settlement) {
        let schedule = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.state != ThreadletState::Waiting {
                return;
            }
            match settlement {
                Ok(value) => {
                    if let Some(task) = inner.current.as_mut() {
                        task.input = if returned {
                            Input::Return(value)
                        } else {
                            Input::Resume(value)
                        };
                    }
                    inner.state = if inner.paused {
                        ThreadletState::Paused
                    } else {
                        ThreadletState::Ready
                    };
                    claim_slot(&mut inner)
                }
                Err(reason) => {
                    drop(inner);
                    tracing::debug!(threadlet = %self.id, %reason, "awaited contract rejected");
                    self.finish(EndState::Failed, Err(reason));
                    self.claim_and_enqueue();
                    return;
                }
            }
        };
        if schedule {
            self.enqueue();
        }
    }

    /// End the active task from inside a dispatch
    fn end_in_dispatch(self: &Arc<Self>, end: EndState, settlement: Settlement) -> SliceOutcome {
        self.finish(end, settlement);
        let mut inner = self.inner.lock();
        let more = inner.current.is_some() && !inner.paused;
        inner.slot = if more { Slot::Queued } else { Slot::Idle };
        SliceOutcome::Ended { more }
    }

    /// Settle the active task and promote the next queued one
    fn finish(&self, end: EndState, settlement: Settlement) {
        let (task, backlog) = {
            let mut inner = self.inner.lock();
            let Some(task) = inner.current.take() else {
                drop(inner);
                diagnostics::internal(&format!("threadlet {} finished without a task", self.id));
                return;
            };
            inner.state = match end {
                EndState::Stopped => ThreadletState::Stopping,
                EndState::Ended | EndState::Failed => ThreadletState::Ending,
            };
            inner.end_state = Some(end);
            inner.end_value = match &settlement {
                Ok(v) | Err(v) => v.clone(),
            };
            inner.work_started = None;
            inner.stop_requested = false;
            (task, std::mem::take(&mut inner.backlog))
        };
        tracing::debug!(threadlet = %self.id, task = task.id.as_u64(), %end, "task settled");

        task.contract.settle(settlement);
        for contract in backlog {
            contract.resolve(Value::Undefined);
        }
        // Dropped outside the lock: generator drops may run user code
        drop(task.body);

        let mut inner = self.inner.lock();
        inner.state = if inner.paused {
            ThreadletState::Paused
        } else {
            ThreadletState::Ready
        };
        start_next(&mut inner);
    }

    fn claim_and_enqueue(self: &Arc<Self>) {
        let schedule = claim_slot(&mut self.inner.lock());
        if schedule {
            self.enqueue();
        }
    }

    fn enqueue(self: &Arc<Self>) {
        let accepted = match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.enqueue(self.clone()),
            None => false,
        };
        if !accepted {
            self.abandon();
        }
    }

    fn unschedule(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.remove(self.id);
        }
    }

    /// The scheduler is gone: reject everything
    fn abandon(&self) {
        let reason = Value::str("scheduler is not available");
        let (current, queued, backlog) = {
            let mut inner = self.inner.lock();
            inner.slot = Slot::Idle;
            inner.epoch += 1;
            inner.state = ThreadletState::Ready;
            let current = inner.current.take();
            if current.is_some() {
                inner.end_state = Some(EndState::Failed);
                inner.end_value = reason.clone();
            }
            let queued: Vec<QueuedTask> = inner.queue.drain(..).collect();
            (current, queued, std::mem::take(&mut inner.backlog))
        };
        tracing::warn!(threadlet = %self.id, "scheduler unavailable; rejecting tasks");
        if let Some(task) = current {
            task.contract.reject(reason.clone());
        }
        for task in queued {
            task.contract.reject(reason.clone());
        }
        for contract in backlog {
            contract.reject(reason.clone());
        }
    }
}
