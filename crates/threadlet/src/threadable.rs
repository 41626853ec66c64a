//! Suspendable computations and the adapter that normalizes them.
//!
//! A [`Generator`] is a resumable step sequence: each `resume` hands back a
//! [`Step`] saying whether the computation yielded or returned, and what it
//! produced. A produced [`Outcome`] is either a plain value, a nested
//! computation (a synchronous call when yielded, a tail call when returned),
//! or a contract to wait on.
//!
//! [`Threadable`] accepts plain functions, generator functions, generator
//! instances and constants and turns each into a generator, either for a
//! [`Threadlet`](crate::Threadlet) to step cooperatively or to be drained
//! inline with [`Threadable::call_inline`].

use crate::contract::{Contract, SealedContract};
use crate::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A resumable step sequence
pub trait Generator: Send {
    /// Resume with the value produced by the previous step (or by the
    /// awaited contract). `Err` is an exception thrown by the computation.
    fn resume(&mut self, input: Value) -> Result<Step, Value>;
}

/// What a step produced
pub enum Outcome {
    /// A plain value
    Value(Value),
    /// A nested computation
    Nested(Box<dyn Generator>),
    /// A contract to wait on
    Future(SealedContract),
}

/// Result of resuming a generator once
pub enum Step {
    /// Suspended, resumable
    Yielded(Outcome),
    /// Exhausted
    Returned(Outcome),
}

impl Step {
    /// Voluntary yield of a plain value
    pub fn yielded(value: impl Into<Value>) -> Self {
        Step::Yielded(Outcome::Value(value.into()))
    }

    /// Return a plain value
    pub fn done(value: impl Into<Value>) -> Self {
        Step::Returned(Outcome::Value(value.into()))
    }

    /// Call a nested computation; its return value resumes this one
    pub fn call(nested: Box<dyn Generator>) -> Self {
        Step::Yielded(Outcome::Nested(nested))
    }

    /// Replace this computation with `nested` (tail call)
    pub fn chain(nested: Box<dyn Generator>) -> Self {
        Step::Returned(Outcome::Nested(nested))
    }

    /// Wait for `contract`, then resume with its value
    pub fn wait(contract: SealedContract) -> Self {
        Step::Yielded(Outcome::Future(contract))
    }

    /// Return whatever `contract` resolves with
    pub fn return_future(contract: SealedContract) -> Self {
        Step::Returned(Outcome::Future(contract))
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::Nested(_) => f.write_str("Nested(..)"),
            Outcome::Future(c) => f.debug_tuple("Future").field(c).finish(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Yielded(o) => f.debug_tuple("Yielded").field(o).finish(),
            Step::Returned(o) => f.debug_tuple("Returned").field(o).finish(),
        }
    }
}

// ============================================================================
// Generator helpers
// ============================================================================

struct FnGenerator<F> {
    step: F,
}

impl<F> Generator for FnGenerator<F>
where
    F: FnMut(Value) -> Result<Step, Value> + Send,
{
    fn resume(&mut self, input: Value) -> Result<Step, Value> {
        (self.step)(input)
    }
}

/// Build a generator from a hand-written state machine
pub fn from_fn<F>(step: F) -> Box<dyn Generator>
where
    F: FnMut(Value) -> Result<Step, Value> + Send + 'static,
{
    Box::new(FnGenerator { step })
}

/// Single-step generator around a plain function call
struct CallOnce {
    func: Option<PlainFn>,
    args: Vec<Value>,
}

impl Generator for CallOnce {
    fn resume(&mut self, _input: Value) -> Result<Step, Value> {
        match self.func.take() {
            Some(f) => f(std::mem::take(&mut self.args)).map(Step::done),
            None => Err(Value::str("generator already finished")),
        }
    }
}

// ============================================================================
// Threadable
// ============================================================================

type PlainFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, Value> + Send + Sync>;
type GeneratorFn = Arc<dyn Fn(Vec<Value>) -> Box<dyn Generator> + Send + Sync>;

#[derive(Clone)]
enum Kind {
    Function(PlainFn),
    Generator(GeneratorFn),
    Instance(Arc<Mutex<Option<Box<dyn Generator>>>>),
    Constant(Value),
}

/// A computation normalized for scheduling
///
/// Cheap to clone; clones of an `instance` share the single underlying
/// generator.
#[derive(Clone)]
pub struct Threadable {
    kind: Kind,
}

impl Threadable {
    /// Wrap a plain function: one step returning its result
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Self {
            kind: Kind::Function(Arc::new(f)),
        }
    }

    /// Wrap a generator function, instantiated per invocation
    pub fn generator<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Box<dyn Generator> + Send + Sync + 'static,
    {
        Self {
            kind: Kind::Generator(Arc::new(f)),
        }
    }

    /// Accept an already-instantiated generator. Arguments are ignored.
    pub fn instance(generator: Box<dyn Generator>) -> Self {
        Self {
            kind: Kind::Instance(Arc::new(Mutex::new(Some(generator)))),
        }
    }

    /// Wrap a non-function value
    pub fn constant(value: impl Into<Value>) -> Self {
        Self {
            kind: Kind::Constant(value.into()),
        }
    }

    /// Produce the raw step sequence for a threadlet to drive
    pub fn instantiate(&self, args: Vec<Value>) -> Box<dyn Generator> {
        match &self.kind {
            Kind::Function(f) => Box::new(CallOnce {
                func: Some(f.clone()),
                args,
            }),
            Kind::Generator(f) => f(args),
            Kind::Instance(slot) => match slot.lock().take() {
                Some(g) => g,
                None => from_fn(|_| Err(Value::str("generator instance already consumed"))),
            },
            Kind::Constant(value) => {
                let result = if args.is_empty() {
                    value.clone()
                } else {
                    let mut items = Vec::with_capacity(args.len() + 1);
                    items.push(value.clone());
                    items.extend(args);
                    Value::List(items)
                };
                let mut pending = Some(result);
                from_fn(move |_| {
                    pending
                        .take()
                        .map(Step::done)
                        .ok_or_else(|| Value::str("generator already finished"))
                })
            }
        }
    }

    /// Drain the computation without a threadlet
    ///
    /// Every suspension point is passed through synchronously; contracts are
    /// awaited by continuation, so the returned contract settles as soon as
    /// the last awaited contract does.
    pub fn call_inline(&self, args: Vec<Value>) -> SealedContract {
        let root = match panic::catch_unwind(AssertUnwindSafe(|| self.instantiate(args))) {
            Ok(root) => root,
            Err(payload) => return Contract::rejected(panic_value(payload)).sealed(),
        };
        let run = Arc::new(InlineRun {
            stack: Mutex::new(Some(CallStack::new(root))),
            contract: Contract::new(),
        });
        let out = run.contract.sealed();
        run.drive(Input::Resume(Value::Undefined));
        out
    }
}

impl fmt::Debug for Threadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Function(_) => "function",
            Kind::Generator(_) => "generator",
            Kind::Instance(_) => "instance",
            Kind::Constant(_) => "constant",
        };
        f.debug_struct("Threadable").field("kind", &kind).finish()
    }
}

impl From<Value> for Threadable {
    fn from(value: Value) -> Self {
        Threadable::constant(value)
    }
}

impl From<Box<dyn Generator>> for Threadable {
    fn from(generator: Box<dyn Generator>) -> Self {
        Threadable::instance(generator)
    }
}

// ============================================================================
// Call stack stepping (shared by threadlets and inline runs)
// ============================================================================

/// How the next step should be fed
#[derive(Debug, Clone)]
pub(crate) enum Input {
    /// Resume the active computation with a value
    Resume(Value),
    /// The active computation has returned this value (a returned future
    /// that has since resolved)
    Return(Value),
}

/// Result of advancing a call stack by one resume
pub(crate) enum Advance {
    /// Keep going: resume the (possibly new) active computation with this
    Continue(Value),
    /// Voluntary yield of a plain value
    Yield(Value),
    /// Wait for a contract; `returned` if the computation returned it
    Await {
        contract: SealedContract,
        returned: bool,
    },
    /// Outermost computation returned
    Finished(Value),
}

/// Active computation plus suspended callers
pub(crate) struct CallStack {
    active: Box<dyn Generator>,
    parents: Vec<Box<dyn Generator>>,
}

impl CallStack {
    pub(crate) fn new(root: Box<dyn Generator>) -> Self {
        Self {
            active: root,
            parents: Vec::new(),
        }
    }

    /// Number of suspended callers
    pub(crate) fn depth(&self) -> usize {
        self.parents.len()
    }

    /// Advance by one resume. `Err` is a thrown exception (or a panic,
    /// converted to its message).
    pub(crate) fn step(&mut self, input: Input) -> Result<Advance, Value> {
        let value = match input {
            Input::Return(v) => return Ok(self.return_value(v)),
            Input::Resume(v) => v,
        };
        let active = &mut self.active;
        let step = panic::catch_unwind(AssertUnwindSafe(|| active.resume(value)))
            .map_err(panic_value)??;
        Ok(match step {
            Step::Yielded(Outcome::Value(v)) => Advance::Yield(v),
            Step::Yielded(Outcome::Nested(g)) => {
                let caller = std::mem::replace(&mut self.active, g);
                self.parents.push(caller);
                Advance::Continue(Value::Undefined)
            }
            Step::Returned(Outcome::Nested(g)) => {
                self.active = g;
                Advance::Continue(Value::Undefined)
            }
            Step::Returned(Outcome::Value(v)) => self.return_value(v),
            Step::Yielded(Outcome::Future(contract)) => Advance::Await {
                contract,
                returned: false,
            },
            Step::Returned(Outcome::Future(contract)) => Advance::Await {
                contract,
                returned: true,
            },
        })
    }

    /// Implicit return to caller, or finish
    fn return_value(&mut self, value: Value) -> Advance {
        match self.parents.pop() {
            Some(caller) => {
                self.active = caller;
                Advance::Continue(value)
            }
            None => Advance::Finished(value),
        }
    }
}

/// Convert a caught panic payload into a rejection value
pub(crate) fn panic_value(payload: Box<dyn Any + Send>) -> Value {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Value::str(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Value::str(s)
    } else {
        Value::str("computation panicked")
    }
}

struct InlineRun {
    stack: Mutex<Option<CallStack>>,
    contract: Contract,
}

impl InlineRun {
    fn drive(self: &Arc<Self>, mut input: Input) {
        let Some(mut stack) = self.stack.lock().take() else {
            return;
        };
        loop {
            match stack.step(input) {
                Ok(Advance::Continue(v)) | Ok(Advance::Yield(v)) => input = Input::Resume(v),
                Ok(Advance::Finished(v)) => {
                    self.contract.resolve(v);
                    return;
                }
                Ok(Advance::Await { contract, returned }) => {
                    match contract.settlement() {
                        Some(Ok(v)) if returned => {
                            input = Input::Return(v);
                            continue;
                        }
                        Some(Ok(v)) => {
                            input = Input::Resume(v);
                            continue;
                        }
                        Some(Err(e)) => {
                            self.contract.reject(e);
                            return;
                        }
                        None => {}
                    }
                    *self.stack.lock() = Some(stack);
                    let run = self.clone();
                    contract.on_settle(move |settlement| match settlement {
                        Ok(v) if returned => run.drive(Input::Return(v.clone())),
                        Ok(v) => run.drive(Input::Resume(v.clone())),
                        Err(e) => {
                            run.stack.lock().take();
                            run.contract.reject(e.clone());
                        }
                    });
                    return;
                }
                Err(e) => {
                    self.contract.reject(e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields `n` times, then returns `result`
    fn countdown(n: i64, result: i64) -> Box<dyn Generator> {
        let mut left = n;
        from_fn(move |_| {
            if left > 0 {
                left -= 1;
                Ok(Step::yielded(left))
            } else {
                Ok(Step::done(result))
            }
        })
    }

    #[test]
    fn test_function_single_step() {
        let t = Threadable::function(|args| Ok(Value::Int(args.len() as i64)));
        let mut g = t.instantiate(vec![Value::Int(1), Value::Int(2)]);
        match g.resume(Value::Undefined).unwrap() {
            Step::Returned(Outcome::Value(v)) => assert_eq!(v, Value::Int(2)),
            other => panic!("unexpected step {:?}", other),
        }
        assert!(g.resume(Value::Undefined).is_err());
    }

    #[test]
    fn test_constant_with_and_without_args() {
        let t = Threadable::constant(7);
        assert_eq!(
            t.call_inline(vec![]).settlement(),
            Some(Ok(Value::Int(7)))
        );
        assert_eq!(
            t.call_inline(vec![Value::Int(8), Value::str("x")]).settlement(),
            Some(Ok(Value::List(vec![
                Value::Int(7),
                Value::Int(8),
                Value::str("x")
            ])))
        );
    }

    #[test]
    fn test_instance_is_one_shot() {
        let t = Threadable::instance(countdown(2, 5));
        assert_eq!(t.call_inline(vec![Value::Int(99)]).settlement(), Some(Ok(Value::Int(5))));
        assert!(t.call_inline(vec![]).is_rejected());
    }

    #[test]
    fn test_generator_function_receives_args() {
        let t = Threadable::generator(|args| {
            let n = args.first().and_then(Value::as_int).unwrap_or(0);
            countdown(n, n * 10)
        });
        assert_eq!(t.call_inline(vec![Value::Int(3)]).value(), Some(Value::Int(30)));
    }

    #[test]
    fn test_inline_call_and_chain() {
        // outer calls inner (yield nested), adds one, then chains to a constant list
        let t = Threadable::generator(|_| {
            let mut stage = 0;
            from_fn(move |input| {
                stage += 1;
                match stage {
                    1 => Ok(Step::call(countdown(2, 40))),
                    2 => {
                        assert_eq!(input, Value::Int(40));
                        Ok(Step::yielded(input.as_int().unwrap() + 1))
                    }
                    _ => Ok(Step::chain(
                        Threadable::constant(input).instantiate(vec![Value::Int(0)]),
                    )),
                }
            })
        });
        assert_eq!(
            t.call_inline(vec![]).value(),
            Some(Value::List(vec![Value::Int(41), Value::Int(0)]))
        );
    }

    #[test]
    fn test_inline_awaits_pending_contract() {
        let gate = Contract::new();
        let waited = gate.sealed();
        let t = Threadable::generator(move |_| {
            let waited = waited.clone();
            let mut first = true;
            from_fn(move |input| {
                if first {
                    first = false;
                    Ok(Step::wait(waited.clone()))
                } else {
                    Ok(Step::done(input))
                }
            })
        });
        let out = t.call_inline(vec![]);
        assert!(!out.is_settled());
        gate.resolve("opened");
        assert_eq!(out.value(), Some(Value::str("opened")));
    }

    #[test]
    fn test_inline_returned_future_finishes_with_its_value() {
        let t = Threadable::generator(|_| {
            from_fn(|_| Ok(Step::return_future(Contract::resolved(3).sealed())))
        });
        assert_eq!(t.call_inline(vec![]).value(), Some(Value::Int(3)));
    }

    #[test]
    fn test_inline_rejected_contract_rejects() {
        let t = Threadable::generator(|_| from_fn(|_| Ok(Step::wait(Contract::rejected("io").sealed()))));
        assert_eq!(t.call_inline(vec![]).settlement(), Some(Err(Value::str("io"))));
    }

    #[test]
    fn test_panic_becomes_rejection() {
        let t = Threadable::function(|_| panic!("kaboom"));
        assert_eq!(t.call_inline(vec![]).settlement(), Some(Err(Value::str("kaboom"))));
    }

    #[test]
    fn test_panicking_factory_rejects_inline() {
        let t = Threadable::generator(|_| panic!("factory"));
        assert_eq!(t.call_inline(vec![]).settlement(), Some(Err(Value::str("factory"))));
    }

    #[test]
    fn test_inline_many_settled_awaits() {
        let t = Threadable::generator(|_| {
            let mut left = 20_000;
            let mut total = 0;
            from_fn(move |input| {
                total += input.as_int().unwrap_or(0);
                if left == 0 {
                    return Ok(Step::done(total));
                }
                left -= 1;
                Ok(Step::wait(Contract::resolved(1).sealed()))
            })
        });
        assert_eq!(t.call_inline(vec![]).value(), Some(Value::Int(20_000)));
    }

    #[test]
    fn test_inline_many_chained_awaits() {
        // Each awaited contract is settled by a then-handler before the wait
        let t = Threadable::generator(|_| {
            let mut left = 20_000;
            from_fn(move |_| {
                if left == 0 {
                    return Ok(Step::done("drained"));
                }
                left -= 1;
                let gate = Contract::new();
                let out = gate.then(Ok);
                gate.resolve(left);
                Ok(Step::wait(out))
            })
        });
        assert_eq!(t.call_inline(vec![]).value(), Some(Value::str("drained")));
    }

    #[test]
    fn test_call_stack_depth() {
        let mut stack = CallStack::new(from_fn(|_| Ok(Step::call(countdown(1, 0)))));
        assert!(matches!(
            stack.step(Input::Resume(Value::Undefined)),
            Ok(Advance::Continue(Value::Undefined))
        ));
        assert_eq!(stack.depth(), 1);
    }
}
