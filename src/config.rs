//! Scheduler tuning.
//!
//! Values are resolved in this order, highest priority first:
//!
//! 1. values set on [`SchedulerBuilder`](crate::SchedulerBuilder)
//! 2. `KERNELQ_*` environment variables
//! 3. [`Config::default()`]
//!
//! | Variable | Maps to |
//! |----------|---------|
//! | `KERNELQ_EVENT_CAPACITY` | `event_capacity` |
//! | `KERNELQ_SEGMENT_CAPACITY` | `segment_capacity` |
//! | `KERNELQ_SEGMENT_LIMIT` | `segment_limit` |
//! | `KERNELQ_EXECUTE_PASSES` | `execute_passes` |
//! | `KERNELQ_INTERRUPT_RETRIES` | `interrupt_retries` |

use crate::error::{Error, Result};
use crate::taskq::{DEFAULT_SEGMENT_CAPACITY, DEFAULT_SEGMENT_LIMIT};

pub const ENV_EVENT_CAPACITY: &str = "KERNELQ_EVENT_CAPACITY";
pub const ENV_SEGMENT_CAPACITY: &str = "KERNELQ_SEGMENT_CAPACITY";
pub const ENV_SEGMENT_LIMIT: &str = "KERNELQ_SEGMENT_LIMIT";
pub const ENV_EXECUTE_PASSES: &str = "KERNELQ_EXECUTE_PASSES";
pub const ENV_INTERRUPT_RETRIES: &str = "KERNELQ_INTERRUPT_RETRIES";

/// Sizes and budgets of a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Kernel records collected per wait.
    pub event_capacity: usize,
    /// Jobs in the first segment of a fresh loading chain.
    pub segment_capacity: usize,
    /// Largest segment the task queue grows to.
    pub segment_limit: usize,
    /// Passes [`Scheduler::execute`](crate::Scheduler::execute) makes over
    /// tasks queued while it runs.
    pub execute_passes: usize,
    /// `EINTR` retries per wait.
    pub interrupt_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_capacity: 64,
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            segment_limit: DEFAULT_SEGMENT_LIMIT,
            execute_passes: 3,
            interrupt_retries: 16,
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Raises zero sizes to one and keeps the segment limit at or above the
    /// first segment's capacity.
    pub(crate) fn normalized(mut self) -> Self {
        self.event_capacity = self.event_capacity.max(1);
        self.segment_capacity = self.segment_capacity.max(1);
        self.segment_limit = self.segment_limit.max(self.segment_capacity);
        self.execute_passes = self.execute_passes.max(1);
        self
    }
}

/// Applies the `KERNELQ_*` variables that are set.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_env_overrides_from(config, |name| std::env::var(name).ok())
}

/// Applies overrides read through `lookup` instead of the process
/// environment.
pub fn apply_env_overrides_from<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let fields: [(&'static str, &mut usize); 5] = [
        (ENV_EVENT_CAPACITY, &mut config.event_capacity),
        (ENV_SEGMENT_CAPACITY, &mut config.segment_capacity),
        (ENV_SEGMENT_LIMIT, &mut config.segment_limit),
        (ENV_EXECUTE_PASSES, &mut config.execute_passes),
        (ENV_INTERRUPT_RETRIES, &mut config.interrupt_retries),
    ];

    for (variable, field) in fields {
        if let Some(value) = lookup(variable) {
            *field = parse_usize(variable, &value)?;
        }
    }

    Ok(())
}

fn parse_usize(variable: &'static str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| Error::Config {
        variable,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.segment_capacity, 4);
        assert_eq!(config.segment_limit, 128);
        assert_eq!(config.execute_passes, 3);
    }

    #[test]
    fn test_overrides_apply_only_when_set() {
        let mut config = Config::default();

        apply_env_overrides_from(
            &mut config,
            lookup(&[(ENV_EVENT_CAPACITY, " 8 "), (ENV_EXECUTE_PASSES, "1")]),
        )
        .unwrap();

        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.execute_passes, 1);
        assert_eq!(config.segment_limit, 128);
    }

    #[test]
    fn test_unparseable_override() {
        let mut config = Config::default();

        let error = apply_env_overrides_from(&mut config, lookup(&[(ENV_SEGMENT_LIMIT, "lots")]))
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Config { variable: ENV_SEGMENT_LIMIT, ref value } if value == "lots"
        ));
    }

    #[test]
    fn test_normalized_clamps_zeroes() {
        let config = Config {
            event_capacity: 0,
            segment_capacity: 0,
            segment_limit: 0,
            execute_passes: 0,
            interrupt_retries: 0,
        }
        .normalized();

        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.segment_capacity, 1);
        assert_eq!(config.segment_limit, 1);
        assert_eq!(config.execute_passes, 1);
    }
}
