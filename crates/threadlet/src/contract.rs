//! Contracts: one-shot completion handles with ordered continuations.
//!
//! A [`Contract`] can be resolved or rejected exactly once, independently of
//! whoever produces the value. Continuations attached with `then`, `catch`,
//! `finally` or `on_settle` are stored until settlement and then dispatched
//! once each, in attachment order. Handlers attached while the queue is being
//! dispatched join the tail of the same queue, so there is only ever a single
//! linear chain of dispatch per contract.
//!
//! [`SealedContract`] is the observe-only view handed out by
//! [`Threadlet::run`](crate::Threadlet::run): callers can wait on a task but
//! cannot settle it.

use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a settled contract: resolved value or rejection reason
pub type Settlement = Result<Value, Value>;

type Handler = Box<dyn FnOnce(&Settlement) + Send>;

thread_local! {
    /// Contracts waiting for the outermost flush on this thread
    static PENDING: RefCell<Option<VecDeque<SealedContract>>> = const { RefCell::new(None) };
}

struct ContractState {
    settlement: Option<Settlement>,
    handlers: VecDeque<Handler>,
    /// A handler queue drain is in progress
    flushing: bool,
    /// Any continuation was ever attached
    observed: bool,
}

struct ContractInner {
    state: Mutex<ContractState>,
    settled: Condvar,
}

/// Observe-only handle to a contract
#[derive(Clone)]
pub struct SealedContract {
    inner: Arc<ContractInner>,
}

/// Settle-capable contract
///
/// Dereferences to [`SealedContract`] for all observation methods.
#[derive(Clone)]
pub struct Contract {
    sealed: SealedContract,
}

impl Contract {
    /// Create a pending contract
    pub fn new() -> Self {
        Self {
            sealed: SealedContract {
                inner: Arc::new(ContractInner {
                    state: Mutex::new(ContractState {
                        settlement: None,
                        handlers: VecDeque::new(),
                        flushing: false,
                        observed: false,
                    }),
                    settled: Condvar::new(),
                }),
            },
        }
    }

    /// Create a contract already resolved with `value`
    pub fn resolved(value: impl Into<Value>) -> Self {
        let contract = Self::new();
        contract.resolve(value);
        contract
    }

    /// Create a contract already rejected with `reason`
    ///
    /// Marked as observed: a pre-rejected contract is always handed to
    /// someone who asked for it.
    pub fn rejected(reason: impl Into<Value>) -> Self {
        let contract = Self::new();
        contract.sealed.inner.state.lock().observed = true;
        contract.reject(reason);
        contract
    }

    /// Resolve with `value`. Returns false if already settled.
    pub fn resolve(&self, value: impl Into<Value>) -> bool {
        self.settle(Ok(value.into()))
    }

    /// Reject with `reason`. Returns false if already settled.
    pub fn reject(&self, reason: impl Into<Value>) -> bool {
        self.settle(Err(reason.into()))
    }

    /// Settle with a ready-made settlement. Returns false if already settled.
    pub fn settle(&self, settlement: Settlement) -> bool {
        let inner = &self.sealed.inner;
        {
            let mut state = inner.state.lock();
            if state.settlement.is_some() {
                return false;
            }
            if let Err(reason) = &settlement {
                if !state.observed {
                    tracing::warn!(%reason, "unhandled contract rejection");
                }
            }
            state.settlement = Some(settlement);
            inner.settled.notify_all();
        }
        self.sealed.flush();
        true
    }

    /// Settle this contract with whatever `other` settles with
    pub fn follow(&self, other: &SealedContract) {
        let this = self.clone();
        other.on_settle(move |settlement| {
            this.settle(settlement.clone());
        });
    }

    /// Get the observe-only view
    pub fn sealed(&self) -> SealedContract {
        self.sealed.clone()
    }
}

impl Default for Contract {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Contract {
    type Target = SealedContract;

    fn deref(&self) -> &SealedContract {
        &self.sealed
    }
}

impl SealedContract {
    /// Check whether the contract has settled
    pub fn is_settled(&self) -> bool {
        self.inner.state.lock().settlement.is_some()
    }

    /// Check whether the contract resolved successfully
    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.state.lock().settlement, Some(Ok(_)))
    }

    /// Check whether the contract was rejected
    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.state.lock().settlement, Some(Err(_)))
    }

    /// Resolved value or rejection reason, once settled
    pub fn value(&self) -> Option<Value> {
        self.inner
            .state
            .lock()
            .settlement
            .as_ref()
            .map(|s| match s {
                Ok(v) | Err(v) => v.clone(),
            })
    }

    /// Full settlement, once settled
    pub fn settlement(&self) -> Option<Settlement> {
        self.inner.state.lock().settlement.clone()
    }

    /// Check whether two handles refer to the same contract
    pub fn ptr_eq(&self, other: &SealedContract) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach a raw settlement handler
    ///
    /// Runs exactly once: at settlement, or immediately (in queue order) if
    /// the contract has already settled.
    pub fn on_settle<F>(&self, handler: F)
    where
        F: FnOnce(&Settlement) + Send + 'static,
    {
        let ready = {
            let mut state = self.inner.state.lock();
            state.observed = true;
            state.handlers.push_back(Box::new(handler));
            state.settlement.is_some()
        };
        if ready {
            self.flush();
        }
    }

    /// Chain a continuation on resolution; rejections pass through
    pub fn then<F>(&self, f: F) -> SealedContract
    where
        F: FnOnce(Value) -> Settlement + Send + 'static,
    {
        let next = Contract::new();
        let out = next.sealed();
        self.on_settle(move |settlement| {
            let result = match settlement {
                Ok(v) => f(v.clone()),
                Err(e) => Err(e.clone()),
            };
            next.settle(result);
        });
        out
    }

    /// Chain a continuation on rejection; resolutions pass through
    pub fn catch<F>(&self, f: F) -> SealedContract
    where
        F: FnOnce(Value) -> Settlement + Send + 'static,
    {
        let next = Contract::new();
        let out = next.sealed();
        self.on_settle(move |settlement| {
            let result = match settlement {
                Ok(v) => Ok(v.clone()),
                Err(e) => f(e.clone()),
            };
            next.settle(result);
        });
        out
    }

    /// Run `f` on either outcome; the settlement passes through unchanged
    pub fn finally<F>(&self, f: F) -> SealedContract
    where
        F: FnOnce() + Send + 'static,
    {
        let next = Contract::new();
        let out = next.sealed();
        self.on_settle(move |settlement| {
            f();
            next.settle(settlement.clone());
        });
        out
    }

    /// Block until settled
    ///
    /// Only useful when another thread settles the contract; on the
    /// dispatching thread use `Scheduler::run_until_settled` instead.
    pub fn wait(&self) -> Settlement {
        let mut state = self.inner.state.lock();
        state.observed = true;
        loop {
            if let Some(s) = &state.settlement {
                return s.clone();
            }
            self.inner.settled.wait(&mut state);
        }
    }

    /// Block until settled, giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Settlement> {
        let mut state = self.inner.state.lock();
        state.observed = true;
        if state.settlement.is_none() {
            self.inner.settled.wait_for(&mut state, timeout);
        }
        state.settlement.clone()
    }

    /// Run queued handlers on this thread's trampoline.
    ///
    /// Only the outermost flush on a thread drains; nested settlements and
    /// attachments made from inside a handler are queued behind it, so
    /// arbitrarily long chains run in constant stack depth.
    fn flush(&self) {
        let nested = PENDING.with(|pending| {
            let mut pending = pending.borrow_mut();
            match pending.as_mut() {
                Some(queue) => {
                    queue.push_back(self.clone());
                    true
                }
                None => {
                    *pending = Some(VecDeque::new());
                    false
                }
            }
        });
        if nested {
            return;
        }

        self.drain();
        while let Some(next) =
            PENDING.with(|pending| pending.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            next.drain();
        }
        PENDING.with(|pending| *pending.borrow_mut() = None);
    }

    /// Dispatch this contract's handler queue. Returns immediately if
    /// another drain of the same contract is in progress; that drain picks
    /// up anything queued meanwhile.
    fn drain(&self) {
        let settlement = {
            let mut state = self.inner.state.lock();
            if state.flushing {
                return;
            }
            let settlement = match &state.settlement {
                Some(s) => s.clone(),
                None => return,
            };
            state.flushing = true;
            settlement
        };
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                match state.handlers.pop_front() {
                    Some(h) => h,
                    None => {
                        state.flushing = false;
                        return;
                    }
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(|| next(&settlement))).is_err() {
                tracing::error!("contract handler panicked");
            }
        }
    }
}

impl fmt::Debug for SealedContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SealedContract")
            .field("settlement", &state.settlement)
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

impl fmt::Debug for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.sealed.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |s: &str| sink.lock().push(s.to_string()))
    }

    #[test]
    fn test_resolve_once() {
        let c = Contract::new();
        assert!(!c.is_settled());
        assert!(c.resolve(1));
        assert!(!c.resolve(2));
        assert!(!c.reject("late"));
        assert!(c.is_resolved());
        assert_eq!(c.value(), Some(Value::Int(1)));
    }

    #[test]
    fn test_handlers_before_settlement_run_in_order() {
        let (log, push) = recorder();
        let c = Contract::new();
        for name in ["a", "b", "c"] {
            let push = push.clone();
            c.on_settle(move |_| push(name));
        }
        assert!(log.lock().is_empty());
        c.resolve(0);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_handler_attached_after_settlement_runs_once() {
        let (log, push) = recorder();
        let c = Contract::resolved(5);
        c.on_settle(move |s| push(&format!("{:?}", s)));
        c.resolve(6);
        assert_eq!(*log.lock(), vec!["Ok(Int(5))"]);
    }

    #[test]
    fn test_nested_attach_keeps_order() {
        let (log, push) = recorder();
        let c = Contract::new();
        {
            let inner = c.sealed();
            let push = push.clone();
            c.on_settle(move |_| {
                push("first");
                let push = push.clone();
                inner.on_settle(move |_| push("attached-during-dispatch"));
            });
        }
        {
            let push = push.clone();
            c.on_settle(move |_| push("second"));
        }
        c.resolve(());
        assert_eq!(
            *log.lock(),
            vec!["first", "second", "attached-during-dispatch"]
        );
    }

    #[test]
    fn test_then_catch_finally_chain() {
        let (log, push) = recorder();
        let c = Contract::new();
        let out = c
            .then(|v| Ok(Value::Int(v.as_int().unwrap() * 2)))
            .then(|_| Err(Value::str("boom")))
            .then(|_| Ok(Value::str("skipped")))
            .catch(|e| Ok(Value::str(format!("recovered {}", e))))
            .finally(move || push("finally"));
        c.resolve(21);
        assert_eq!(out.settlement(), Some(Ok(Value::str("recovered boom"))));
        assert_eq!(*log.lock(), vec!["finally"]);
    }

    #[test]
    fn test_rejection_passes_through_then() {
        let c = Contract::new();
        let out = c.then(|v| Ok(v));
        c.reject("bad");
        assert_eq!(out.settlement(), Some(Err(Value::str("bad"))));
    }

    #[test]
    fn test_follow() {
        let source = Contract::new();
        let target = Contract::new();
        target.follow(&source.sealed());
        source.reject(7);
        assert_eq!(target.settlement(), Some(Err(Value::Int(7))));
    }

    #[test]
    fn test_panicking_handler_does_not_block_queue() {
        let (log, push) = recorder();
        let c = Contract::new();
        c.on_settle(|_| panic!("handler failure"));
        c.on_settle(move |_| push("after"));
        c.resolve(1);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_long_then_chain_settles_iteratively() {
        let root = Contract::new();
        let mut tail = root.sealed();
        for _ in 0..100_000 {
            tail = tail.then(Ok);
        }
        root.resolve(1);
        assert_eq!(tail.settlement(), Some(Ok(Value::Int(1))));
    }

    #[test]
    fn test_settle_inside_handler_runs_after_current_handler() {
        let (log, push) = recorder();
        let first = Contract::new();
        let second = Contract::new();
        {
            let push = push.clone();
            second.on_settle(move |_| push("second"));
        }
        {
            let second = second.clone();
            let push = push.clone();
            first.on_settle(move |_| {
                second.resolve(2);
                push("first");
            });
        }
        first.resolve(1);
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert!(second.is_resolved());
    }

    #[test]
    fn test_wait_across_threads() {
        let c = Contract::new();
        let remote = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.resolve("done");
        });
        assert_eq!(c.wait(), Ok(Value::str("done")));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c = Contract::new();
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), None);
    }
}
