//! Threadlet Lifecycle Tests
//!
//! Task-level behaviour of a single threadlet:
//! - stop, pause and resume
//! - failures and rejected awaits
//! - nested calls, tail calls and returned futures
//! - construction from loosely typed config
//!
//! # Running Tests
//! ```bash
//! cargo test --test threadlet_tests
//! ```

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadlet::{
    from_fn, ConfigError, Contract, Controls, EndState, Generator, ManualClock, Priority,
    Scheduler, SchedulerConfig, SealedContract, Step, Threadable, Threadlet, ThreadletState,
    Value,
};

fn manual() -> Scheduler {
    Scheduler::new(SchedulerConfig::default().with_clock(Arc::new(ManualClock::new())))
}

fn eager() -> Controls {
    Controls::default().with_yield_interval(Duration::ZERO)
}

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

/// Waits for `gate` and returns double the value it resolves with
fn doubler(gate: SealedContract) -> Threadable {
    Threadable::generator(move |_| {
        let gate = gate.clone();
        let mut waited = false;
        from_fn(move |input| {
            if !waited {
                waited = true;
                Ok(Step::wait(gate.clone()))
            } else {
                Ok(Step::done(input.as_int().unwrap_or(0) * 2))
            }
        })
    })
}

// ===== Stop =====

#[test]
fn test_stop_discards_unstarted_tasks() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let invoked = Arc::new(AtomicBool::new(false));

    let first = t.run(Threadable::generator(|_| countdown(3, 1)), vec![]);
    let flag = invoked.clone();
    let second = t.run(
        Threadable::function(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Int(2))
        }),
        vec![],
    );

    t.stop();
    assert_eq!(first.settlement(), Some(Ok(Value::Undefined)));
    assert_eq!(second.settlement(), Some(Ok(Value::Undefined)));
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    assert!(!invoked.load(Ordering::SeqCst));
    assert!(t.has_stopped());
    assert_eq!(t.end_value(), Value::Undefined);
    assert_eq!(scheduler.snapshot().n_threads, 0);
}

#[test]
fn test_stop_between_slices_ends_at_the_suspension_point() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let steps = Arc::new(Mutex::new(0));
    let counter = steps.clone();
    let c = t.run(
        Threadable::generator(move |_| {
            let counter = counter.clone();
            from_fn(move |_| {
                *counter.lock() += 1;
                Ok(Step::yielded(()))
            })
        }),
        vec![],
    );

    scheduler.tick().unwrap();
    scheduler.tick().unwrap();
    t.stop();
    scheduler.run_until_idle().unwrap();

    assert_eq!(*steps.lock(), 2);
    assert_eq!(c.value(), Some(Value::Undefined));
    assert_eq!(t.end_state(), Some(EndState::Stopped));
    assert!(t.is_ready());

    // The threadlet keeps accepting work
    let next = t.run(Value::Int(9), vec![]);
    scheduler.run_until_idle().unwrap();
    assert_eq!(next.value(), Some(Value::Int(9)));
    assert!(t.has_ended());
}

#[test]
fn test_stop_from_own_task_finishes_the_slice() {
    let scheduler = manual();
    let t = Arc::new(Threadlet::new(
        &scheduler,
        None,
        eager().with_timeslice(Duration::from_millis(10)),
    ));
    let handle = Arc::downgrade(&t);
    let log = Arc::new(Mutex::new(Vec::new()));

    let body_log = log.clone();
    let first = t.run(
        Threadable::generator(move |_| {
            let handle = handle.clone();
            let log = body_log.clone();
            let mut stage = 0;
            from_fn(move |_| {
                stage += 1;
                match stage {
                    1 => {
                        if let Some(t) = handle.upgrade() {
                            t.stop();
                        }
                        Ok(Step::call(countdown(0, 5)))
                    }
                    2 => {
                        log.lock().push("after-stop");
                        Ok(Step::yielded(()))
                    }
                    _ => {
                        log.lock().push("resumed");
                        Ok(Step::done(1))
                    }
                }
            })
        }),
        vec![],
    );
    let invoked = Arc::new(AtomicBool::new(false));
    let queued: Vec<_> = (2..4)
        .map(|i| {
            let flag = invoked.clone();
            t.run(
                Threadable::function(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Int(i))
                }),
                vec![],
            )
        })
        .collect();
    for (c, tag) in [(&first, "first"), (&queued[0], "second"), (&queued[1], "third")] {
        let log = log.clone();
        c.on_settle(move |_| log.lock().push(tag));
    }

    assert_eq!(scheduler.run_until_idle().unwrap(), 1);

    assert_eq!(*log.lock(), vec!["after-stop", "first", "second", "third"]);
    assert_eq!(first.value(), Some(Value::Undefined));
    for c in &queued {
        assert_eq!(c.value(), Some(Value::Undefined));
    }
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(t.end_state(), Some(EndState::Stopped));
    assert!(t.is_idle());
}

#[test]
fn test_stop_from_own_task_overrides_its_result() {
    let scheduler = manual();
    let t = Arc::new(Threadlet::new(&scheduler, None, eager()));
    let handle = Arc::downgrade(&t);
    let c = t.run(
        Threadable::function(move |_| {
            if let Some(t) = handle.upgrade() {
                t.stop();
            }
            Ok(Value::Int(5))
        }),
        vec![],
    );

    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Undefined));
    assert!(t.has_stopped());
    assert_eq!(t.end_value(), Value::Undefined);
}

#[test]
fn test_stop_while_waiting_ignores_late_settlement() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let gate = Contract::new();
    let c = t.run(doubler(gate.sealed()), vec![]);

    scheduler.tick().unwrap();
    assert!(t.is_waiting());
    t.stop();
    assert_eq!(c.value(), Some(Value::Undefined));

    gate.resolve(21);
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    assert!(t.has_stopped());
}

#[test]
fn test_drop_stops_the_threadlet() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(Threadable::generator(|_| countdown(5, 0)), vec![]);
    let submit = t.bind_run(Threadable::constant("bound"));
    drop(t);

    assert_eq!(c.value(), Some(Value::Undefined));
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    assert!(submit(vec![]).is_rejected());
}

// ===== Pause / resume =====

#[test]
fn test_pause_resume_keeps_call_stack() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(
        Threadable::generator(|_| {
            let mut called = false;
            from_fn(move |input| {
                if !called {
                    called = true;
                    Ok(Step::call(countdown(3, 10)))
                } else {
                    Ok(Step::done(input.as_int().unwrap_or(0) + 1))
                }
            })
        }),
        vec![],
    );

    // Enter the nested call, then one nested yield
    scheduler.tick().unwrap();
    scheduler.tick().unwrap();
    assert_eq!(t.call_depth(), 1);

    t.pause();
    assert!(t.is_paused());
    assert_eq!(t.state(), ThreadletState::Paused);
    assert_eq!(scheduler.snapshot().n_threads, 0);
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    assert!(!c.is_settled());

    t.resume();
    assert!(!t.is_paused());
    assert_eq!(t.call_depth(), 1);
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Int(11)));
}

#[test]
fn test_pause_from_own_task_takes_effect_at_the_yield() {
    let scheduler = manual();
    let t = Arc::new(Threadlet::new(&scheduler, None, eager()));
    let handle = Arc::downgrade(&t);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let states = seen.clone();
    let c = t.run(
        Threadable::generator(move |_| {
            let handle = handle.clone();
            let states = states.clone();
            let mut paused = false;
            from_fn(move |_| {
                if paused {
                    return Ok(Step::done(7));
                }
                paused = true;
                if let Some(t) = handle.upgrade() {
                    t.pause();
                    states.lock().push(t.state());
                }
                Ok(Step::yielded(()))
            })
        }),
        vec![],
    );

    assert_eq!(scheduler.run_until_idle().unwrap(), 1);
    assert_eq!(*seen.lock(), vec![ThreadletState::Pausing]);
    assert_eq!(t.state(), ThreadletState::Paused);
    assert!(t.is_paused());
    assert!(!c.is_settled());
    assert_eq!(scheduler.snapshot().n_threads, 0);

    t.resume();
    assert_eq!(scheduler.run_until_idle().unwrap(), 1);
    assert_eq!(c.value(), Some(Value::Int(7)));
    assert_eq!(t.end_state(), Some(EndState::Ended));
}

#[test]
fn test_pause_holds_back_new_tasks() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    t.pause();
    let c = t.run(Value::Int(1), vec![]);
    assert_eq!(t.pending_tasks(), 1);
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    t.resume();
    assert_eq!(t.pending_tasks(), 0);
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Int(1)));
}

#[test]
fn test_resume_while_waiting_does_not_dispatch() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let gate = Contract::new();
    let c = t.run(doubler(gate.sealed()), vec![]);

    scheduler.tick().unwrap();
    t.pause();
    t.resume();
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    assert!(t.is_waiting());

    gate.resolve(4);
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Int(8)));
}

#[test]
fn test_settlement_while_paused_waits_for_resume() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let gate = Contract::new();
    let c = t.run(doubler(gate.sealed()), vec![]);

    scheduler.tick().unwrap();
    t.pause();
    gate.resolve(5);
    assert_eq!(scheduler.run_until_idle().unwrap(), 0);
    assert_eq!(t.state(), ThreadletState::Paused);

    t.resume();
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Int(10)));
}

// ===== Failures =====

#[test]
fn test_throwing_task_rejects_and_others_continue() {
    let scheduler = manual();
    let failing = Threadlet::new(&scheduler, Some("failing"), eager());
    let healthy = Threadlet::new(&scheduler, Some("healthy"), eager());

    let bad = failing.run(Threadable::function(|_| Err(Value::str("boom"))), vec![]);
    let after = failing.run(Value::Int(3), vec![]);
    let good = healthy.run(Threadable::generator(|_| countdown(3, 4)), vec![]);

    scheduler.run_until_idle().unwrap();
    assert_eq!(bad.settlement(), Some(Err(Value::str("boom"))));
    assert_eq!(after.value(), Some(Value::Int(3)));
    assert_eq!(good.value(), Some(Value::Int(4)));
    assert!(failing.has_ended());
}

#[test]
fn test_failure_records_end_state() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(
        Threadable::generator(|_| {
            let mut n = 0;
            from_fn(move |_| {
                n += 1;
                if n < 3 {
                    Ok(Step::yielded(n))
                } else {
                    Err(Value::str("third step"))
                }
            })
        }),
        vec![],
    );
    scheduler.run_until_idle().unwrap();
    assert!(c.is_rejected());
    assert!(t.has_failed());
    assert_eq!(t.end_value(), Value::str("third step"));
}

#[test]
fn test_panic_is_captured_as_failure() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(Threadable::function(|_| panic!("bad input")), vec![]);
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.settlement(), Some(Err(Value::str("bad input"))));
    assert!(t.has_failed());
}

#[test]
fn test_rejected_await_fails_the_task() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let gate = Contract::new();
    let c = t.run(doubler(gate.sealed()), vec![]);

    scheduler.tick().unwrap();
    assert!(t.is_waiting());
    assert_eq!(scheduler.snapshot().n_threads, 0);

    gate.reject("nope");
    assert_eq!(c.settlement(), Some(Err(Value::str("nope"))));
    assert!(t.has_failed());
}

#[test]
fn test_already_settled_await_resumes_immediately() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(doubler(Contract::resolved(6).sealed()), vec![]);
    assert_eq!(scheduler.run_until_idle().unwrap(), 2);
    assert_eq!(c.value(), Some(Value::Int(12)));
}

// ===== Call, chain and returned futures =====

#[test]
fn test_chain_replaces_without_stacking() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(
        Threadable::generator(|_| from_fn(|_| Ok(Step::chain(countdown(2, 77))))),
        vec![],
    );
    scheduler.tick().unwrap();
    assert_eq!(t.call_depth(), 0);
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Int(77)));
}

#[test]
fn test_returned_future_becomes_the_result() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let gate = Contract::new();
    let waited = gate.sealed();
    let c = t.run(
        Threadable::generator(move |_| {
            let waited = waited.clone();
            from_fn(move |_| Ok(Step::return_future(waited.clone())))
        }),
        vec![],
    );
    scheduler.run_until_idle().unwrap();
    assert!(t.is_waiting());
    gate.resolve("late");
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::str("late")));
    assert_eq!(t.end_value(), Value::str("late"));
}

#[test]
fn test_inline_matches_threadlet_result() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let program = Threadable::generator(|args| {
        let base = args.first().and_then(Value::as_int).unwrap_or(0);
        let mut stage = 0;
        from_fn(move |input| {
            stage += 1;
            match stage {
                1 => Ok(Step::call(countdown(2, base))),
                2 => Ok(Step::yielded(input)),
                _ => Ok(Step::chain(
                    Threadable::constant(input).instantiate(vec![Value::Int(1)]),
                )),
            }
        })
    });

    let inline = program.call_inline(vec![Value::Int(5)]);
    t.run(program, vec![Value::Int(5)]);
    scheduler.run_until_idle().unwrap();
    assert_eq!(inline.value(), Some(t.end_value()));
    assert_eq!(t.end_value(), Value::List(vec![Value::Int(5), Value::Int(1)]));
}

#[test]
fn test_instance_threadable_ignores_args() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let c = t.run(countdown(1, 8), vec![Value::Int(100)]);
    scheduler.run_until_idle().unwrap();
    assert_eq!(c.value(), Some(Value::Int(8)));
}

// ===== Construction and submission =====

#[test]
fn test_from_config() {
    let scheduler = manual();
    let t = Threadlet::from_config(
        &scheduler,
        Some("cfg"),
        &json!({"priority": "high", "timeslice": 4, "yieldInterval": 8}),
    )
    .unwrap();
    assert_eq!(t.name(), "cfg");
    assert_eq!(t.controls().priority, Priority::High);
    assert_eq!(t.controls().timeslice, Duration::from_millis(4));
    assert_eq!(t.controls().yield_interval, Duration::from_millis(8));

    let err = Threadlet::from_config(&scheduler, None, &json!({"priority": "urgent"})).unwrap_err();
    assert_eq!(err, ConfigError::InvalidPriority("urgent".to_string()));
    assert!(Threadlet::from_config(&scheduler, None, &json!({"timeslice": -3})).is_err());
}

#[test]
fn test_default_names_are_unique() {
    let scheduler = manual();
    let a = Threadlet::with_defaults(&scheduler, None);
    let b = Threadlet::with_defaults(&scheduler, None);
    assert_ne!(a.name(), b.name());
    assert_eq!(a.controls(), Controls::default());
}

#[test]
fn test_bind_run_submits_in_order() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let double = t.bind_run(Threadable::function(|args| {
        Ok(Value::Int(args.first().and_then(Value::as_int).unwrap_or(0) * 2))
    }));
    let results: Vec<_> = (1..=3).map(|n| double(vec![Value::Int(n)])).collect();
    scheduler.run_until_idle().unwrap();
    let values: Vec<_> = results.iter().filter_map(SealedContract::value).collect();
    assert_eq!(values, vec![Value::Int(2), Value::Int(4), Value::Int(6)]);
}

#[test]
fn test_shutdown_stops_queued_and_rejects_new_work() {
    let scheduler = manual();
    let t = Threadlet::new(&scheduler, None, eager());
    let queued = t.run(Threadable::generator(|_| countdown(2, 0)), vec![]);
    scheduler.shutdown();
    assert_eq!(queued.value(), Some(Value::Undefined));

    let late = t.run(Value::Int(1), vec![]);
    assert!(late.is_rejected());
    assert!(scheduler.tick().is_err());
}
