//! Threadlet control parameters and their validation.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Scheduling priority class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Promoted first
    High = 1,
    /// Default class
    #[default]
    Default = 2,
    /// Promoted last
    Low = 3,
}

impl Priority {
    /// All priorities, highest first
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Default, Priority::Low];

    /// Numeric level (1 = High .. 3 = Low)
    pub fn level(self) -> usize {
        self as usize
    }

    /// Priority for a numeric level
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(Priority::High),
            2 => Some(Priority::Default),
            3 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::High => "high",
            Priority::Default => "default",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "default" | "normal" => Ok(Priority::Default),
            "low" => Ok(Priority::Low),
            _ => Err(ConfigError::InvalidPriority(s.to_string())),
        }
    }
}

/// Default minimum delay between dispatches of the same threadlet
pub const DEFAULT_YIELD_INTERVAL: Duration = Duration::from_millis(2);

/// Control parameters of a threadlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controls {
    /// Priority class
    pub priority: Priority,
    /// Maximum active time per dispatch before a forced yield
    pub timeslice: Duration,
    /// Minimum time between successive dispatches
    pub yield_interval: Duration,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            priority: Priority::Default,
            timeslice: Duration::ZERO,
            yield_interval: DEFAULT_YIELD_INTERVAL,
        }
    }
}

impl Controls {
    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the timeslice
    pub fn with_timeslice(mut self, timeslice: Duration) -> Self {
        self.timeslice = timeslice;
        self
    }

    /// Set the yield interval
    pub fn with_yield_interval(mut self, yield_interval: Duration) -> Self {
        self.yield_interval = yield_interval;
        self
    }

    /// Build controls from a loosely typed object
    ///
    /// Accepted keys: `priority` (name or level 1..=3), `timeslice` and
    /// `yieldInterval` / `yield_interval` (milliseconds). Missing keys take
    /// the values from `defaults`; `null` is treated as missing.
    pub fn from_json(config: &serde_json::Value, defaults: Controls) -> Result<Self, ConfigError> {
        let map = match config {
            serde_json::Value::Null => return Ok(defaults),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(ConfigError::TypeMismatch {
                    field: "controls",
                    expected: "object",
                    got: json_type(other),
                })
            }
        };

        let mut controls = defaults;
        for (key, value) in map {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                "priority" => controls.priority = parse_priority(value)?,
                "timeslice" => controls.timeslice = parse_millis("timeslice", value)?,
                "yieldInterval" | "yield_interval" => {
                    controls.yield_interval = parse_millis("yieldInterval", value)?
                }
                other => return Err(ConfigError::UnknownControl(other.to_string())),
            }
        }
        Ok(controls)
    }
}

fn parse_priority(value: &serde_json::Value) -> Result<Priority, ConfigError> {
    match value {
        serde_json::Value::String(s) => s.parse(),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(Priority::from_level)
            .ok_or_else(|| ConfigError::InvalidPriority(n.to_string())),
        other => Err(ConfigError::TypeMismatch {
            field: "priority",
            expected: "string or integer",
            got: json_type(other),
        }),
    }
}

/// Parse a non-negative millisecond count
pub(crate) fn parse_millis(field: &'static str, value: &serde_json::Value) -> Result<Duration, ConfigError> {
    let ms = match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        other => {
            return Err(ConfigError::TypeMismatch {
                field,
                expected: "number",
                got: json_type(other),
            })
        }
    };
    millis(field, ms)
}

/// Validate a millisecond count and convert it to a duration
pub fn millis(field: &'static str, ms: f64) -> Result<Duration, ConfigError> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(ConfigError::InvalidDuration {
            field,
            value: ms.to_string(),
        });
    }
    Ok(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
