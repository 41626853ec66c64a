//! Build threadlets from a workload, drive the scheduler and collect a report.

use crate::workload::{ClockKind, TaskSpec, Workload, MAX_STEP_MS};
use anyhow::{bail, Context};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadlet::{
    from_fn, Clock, ManualClock, MonotonicClock, Priority, Scheduler, SchedulerConfig,
    SchedulerStats, SealedContract, Step, Threadable, Threadlet, ThreadletId, Tick, Value,
};

/// How simulated work consumes time
#[derive(Clone)]
enum Pace {
    Virtual(Arc<ManualClock>),
    Real,
}

impl Pace {
    fn work(&self, d: Duration) {
        match self {
            Pace::Virtual(clock) => clock.advance(d),
            Pace::Real => std::thread::sleep(d),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub index: usize,
    /// resolved, rejected or pending
    pub outcome: &'static str,
    pub value: Option<Value>,
    pub settled_at_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadletReport {
    pub name: String,
    pub priority: Priority,
    pub dispatches: u64,
    pub steps: u64,
    pub first_dispatch_ms: Option<f64>,
    pub last_dispatch_ms: Option<f64>,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub clock: &'static str,
    pub seed: u64,
    pub elapsed_ms: f64,
    pub stats: SchedulerStats,
    pub threadlets: Vec<ThreadletReport>,
    /// Threadlet name per dispatch, when tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<String>>,
}

impl Report {
    pub fn rejected(&self) -> usize {
        self.threadlets
            .iter()
            .flat_map(|t| &t.tasks)
            .filter(|t| t.outcome == "rejected")
            .count()
    }
}

struct Entry {
    threadlet: Threadlet,
    tasks: Vec<SealedContract>,
    settled_at: Vec<Arc<Mutex<Option<Duration>>>>,
    steps: Arc<AtomicU64>,
}

/// Dispatch timing per threadlet
#[derive(Default)]
struct Seen {
    first: Option<Duration>,
    last: Option<Duration>,
}

pub struct Simulation {
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    clock_kind: ClockKind,
    seed: u64,
    max_dispatches: u64,
    entries: Vec<Entry>,
}

impl Simulation {
    pub fn new(workload: &Workload, seed: Option<u64>, max_dispatches: Option<u64>) -> anyhow::Result<Self> {
        let defaults = workload.default_controls()?;
        let (pace, clock): (Pace, Arc<dyn Clock>) = match workload.scheduler.clock {
            ClockKind::Virtual => {
                let manual = Arc::new(ManualClock::new());
                (Pace::Virtual(manual.clone()), manual as Arc<dyn Clock>)
            }
            ClockKind::Real => (Pace::Real, Arc::new(MonotonicClock::new()) as Arc<dyn Clock>),
        };
        let scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_clock(clock.clone())
                .with_default_controls(defaults),
        );

        let seed = seed.unwrap_or(workload.scheduler.seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut entries = Vec::with_capacity(workload.threadlets.len());
        for spec in &workload.threadlets {
            let controls = spec
                .controls(defaults)
                .with_context(|| format!("Invalid controls for threadlet {}", spec.name))?;
            let threadlet = Threadlet::new(&scheduler, Some(&spec.name), controls);
            let steps = Arc::new(AtomicU64::new(0));
            let mut tasks = Vec::with_capacity(spec.tasks.len());
            let mut settled_at = Vec::with_capacity(spec.tasks.len());
            for task in &spec.tasks {
                let body = task_body(task, &mut rng, pace.clone(), steps.clone());
                let contract = threadlet.run(body, vec![]);
                let slot = Arc::new(Mutex::new(None));
                let record = slot.clone();
                let clock = clock.clone();
                contract.on_settle(move |_| *record.lock() = Some(clock.now()));
                tasks.push(contract);
                settled_at.push(slot);
            }
            entries.push(Entry {
                threadlet,
                tasks,
                settled_at,
                steps,
            });
        }
        tracing::info!(
            threadlets = entries.len(),
            tasks = workload.task_count(),
            seed,
            "workload loaded"
        );

        Ok(Self {
            scheduler,
            clock,
            clock_kind: workload.scheduler.clock,
            seed,
            max_dispatches: max_dispatches.unwrap_or(workload.scheduler.max_dispatches),
            entries,
        })
    }

    /// Dispatch until idle and summarize
    pub fn run(self, trace: bool) -> anyhow::Result<Report> {
        let names: FxHashMap<ThreadletId, &str> = self
            .entries
            .iter()
            .map(|e| (e.threadlet.id(), e.threadlet.name()))
            .collect();
        let mut seen: FxHashMap<ThreadletId, Seen> = FxHashMap::default();
        let mut timeline = Vec::new();
        let mut dispatches = 0u64;

        loop {
            let before = self.clock.now();
            match self.scheduler.tick()? {
                Tick::Dispatched(id) => {
                    dispatches += 1;
                    let s = seen.entry(id).or_default();
                    s.first.get_or_insert(before);
                    s.last = Some(before);
                    if trace {
                        timeline.push(names.get(&id).copied().unwrap_or("?").to_string());
                    }
                    if dispatches >= self.max_dispatches {
                        bail!("Dispatch limit of {} reached", self.max_dispatches);
                    }
                }
                Tick::Idle {
                    next_deadline: Some(deadline),
                } => self.clock.park_until(deadline),
                Tick::Idle {
                    next_deadline: None,
                } => break,
            }
        }

        let elapsed = self.clock.now();
        let threadlets = self
            .entries
            .iter()
            .map(|e| {
                let s = seen.get(&e.threadlet.id());
                ThreadletReport {
                    name: e.threadlet.name().to_string(),
                    priority: e.threadlet.controls().priority,
                    dispatches: e.threadlet.dispatch_count(),
                    steps: e.steps.load(Ordering::Relaxed),
                    first_dispatch_ms: s.and_then(|s| s.first).map(as_ms),
                    last_dispatch_ms: s.and_then(|s| s.last).map(as_ms),
                    tasks: e
                        .tasks
                        .iter()
                        .zip(&e.settled_at)
                        .enumerate()
                        .map(|(index, (c, at))| task_report(index, c, *at.lock()))
                        .collect(),
                }
            })
            .collect();
        tracing::info!(dispatches, elapsed_ms = as_ms(elapsed), "simulation finished");

        Ok(Report {
            clock: match self.clock_kind {
                ClockKind::Virtual => "virtual",
                ClockKind::Real => "real",
            },
            seed: self.seed,
            elapsed_ms: as_ms(elapsed),
            stats: self.scheduler.stats(),
            threadlets,
            timeline: trace.then_some(timeline),
        })
    }
}

fn task_report(index: usize, contract: &SealedContract, at: Option<Duration>) -> TaskReport {
    let outcome = match contract.settlement() {
        Some(Ok(_)) => "resolved",
        Some(Err(_)) => "rejected",
        None => "pending",
    };
    TaskReport {
        index,
        outcome,
        value: contract.value(),
        settled_at_ms: at.map(as_ms),
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Per-step work with jitter drawn up front so runs are reproducible
fn task_body(spec: &TaskSpec, rng: &mut StdRng, pace: Pace, steps: Arc<AtomicU64>) -> Threadable {
    let work: Vec<Duration> = (0..spec.steps)
        .map(|_| {
            let jitter = if spec.jitter_ms > 0.0 {
                rng.gen_range(-spec.jitter_ms..=spec.jitter_ms)
            } else {
                0.0
            };
            Duration::from_secs_f64((spec.work_ms + jitter).clamp(0.0, MAX_STEP_MS) / 1000.0)
        })
        .collect();
    let total = spec.steps;
    let fail_at = spec.fail_at;
    let result = spec.result_value();

    Threadable::generator(move |_| {
        let (work, pace, steps, result) = (work.clone(), pace.clone(), steps.clone(), result.clone());
        let mut done = 0u32;
        from_fn(move |_| {
            if done == total {
                return Ok(Step::done(result.clone()));
            }
            pace.work(work[done as usize]);
            steps.fetch_add(1, Ordering::Relaxed);
            done += 1;
            if Some(done) == fail_at {
                return Err(Value::str(format!("task failed at step {}", done)));
            }
            if done == total {
                Ok(Step::done(result.clone()))
            } else {
                Ok(Step::yielded(done as i64))
            }
        })
    })
}
