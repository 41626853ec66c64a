//! Workload files: scheduler defaults plus threadlets and their tasks.
//!
//! ```toml
//! [scheduler]
//! yield_interval_ms = 2
//! seed = 7
//!
//! [[threadlet]]
//! name = "ui"
//! priority = "high"
//!
//! [[threadlet.task]]
//! steps = 10
//! work_ms = 0.5
//! result = 42
//! ```

use anyhow::{bail, Context};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use threadlet::{millis, ConfigError, Controls, Value};

/// Which clock drives the simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    /// Manual clock advanced by simulated work
    #[default]
    Virtual,
    /// Wall clock; simulated work sleeps
    Real,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub priority: String,
    pub timeslice_ms: f64,
    pub yield_interval_ms: f64,
    pub clock: ClockKind,
    pub seed: u64,
    pub max_dispatches: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            priority: "default".to_string(),
            timeslice_ms: 0.0,
            yield_interval_ms: 2.0,
            clock: ClockKind::Virtual,
            seed: 0,
            max_dispatches: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadletSpec {
    pub name: String,
    pub priority: Option<String>,
    pub timeslice_ms: Option<f64>,
    pub yield_interval_ms: Option<f64>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSpec {
    /// Units of work; the task yields between them
    pub steps: u32,
    /// Simulated work per step
    pub work_ms: f64,
    /// Uniform +/- jitter applied to each step's work
    pub jitter_ms: f64,
    /// Value to resolve with (defaults to the step count)
    pub result: Option<toml::Value>,
    /// Throw instead of completing this (1-based) step
    pub fail_at: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default, rename = "threadlet")]
    pub threadlets: Vec<ThreadletSpec>,
}

impl FromStr for Workload {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let workload: Workload = toml::from_str(s).context("Invalid workload TOML")?;
        workload.validate()?;
        Ok(workload)
    }
}

impl Workload {
    /// Load and validate a workload file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workload {}", path.display()))?;
        text.parse()
            .with_context(|| format!("Failed to load workload {}", path.display()))
    }

    /// Controls for threadlets that leave fields unset
    pub fn default_controls(&self) -> Result<Controls, ConfigError> {
        let s = &self.scheduler;
        Ok(Controls {
            priority: s.priority.parse()?,
            timeslice: millis("timeslice", s.timeslice_ms)?,
            yield_interval: millis("yieldInterval", s.yield_interval_ms)?,
        })
    }

    /// Total tasks across all threadlets
    pub fn task_count(&self) -> usize {
        self.threadlets.iter().map(|t| t.tasks.len()).sum()
    }

    fn validate(&self) -> anyhow::Result<()> {
        let defaults = self.default_controls().context("Invalid [scheduler] section")?;
        let mut names = FxHashSet::default();
        for t in &self.threadlets {
            if !names.insert(t.name.as_str()) {
                bail!("Duplicate threadlet name: {}", t.name);
            }
            t.controls(defaults)
                .with_context(|| format!("Invalid controls for threadlet {}", t.name))?;
            for (i, task) in t.tasks.iter().enumerate() {
                task.validate()
                    .with_context(|| format!("Invalid task {} of threadlet {}", i + 1, t.name))?;
            }
        }
        Ok(())
    }
}

impl ThreadletSpec {
    /// Resolve controls against the scheduler defaults
    pub fn controls(&self, defaults: Controls) -> Result<Controls, ConfigError> {
        let mut controls = defaults;
        if let Some(p) = &self.priority {
            controls.priority = p.parse()?;
        }
        if let Some(ms) = self.timeslice_ms {
            controls.timeslice = millis("timeslice", ms)?;
        }
        if let Some(ms) = self.yield_interval_ms {
            controls.yield_interval = millis("yieldInterval", ms)?;
        }
        Ok(controls)
    }
}

/// Upper bound on `work_ms + jitter_ms` for a single step (one hour)
pub const MAX_STEP_MS: f64 = 3_600_000.0;

impl TaskSpec {
    fn validate(&self) -> anyhow::Result<()> {
        millis("work_ms", self.work_ms)?;
        millis("jitter_ms", self.jitter_ms)?;
        if self.work_ms + self.jitter_ms > MAX_STEP_MS {
            bail!(
                "work_ms + jitter_ms is {} but a step may take at most {} ms",
                self.work_ms + self.jitter_ms,
                MAX_STEP_MS
            );
        }
        if let Some(at) = self.fail_at {
            if at == 0 || at > self.steps {
                bail!("fail_at {} is outside 1..={}", at, self.steps);
            }
        }
        Ok(())
    }

    /// Value the task resolves with
    pub fn result_value(&self) -> Value {
        match &self.result {
            Some(v) => to_value(v),
            None => Value::Int(self.steps as i64),
        }
    }
}

fn to_value(v: &toml::Value) -> Value {
    match v {
        toml::Value::String(s) => Value::str(s.as_str()),
        toml::Value::Integer(i) => Value::Int(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Array(items) => Value::List(items.iter().map(to_value).collect()),
        other => Value::str(other.to_string()),
    }
}
