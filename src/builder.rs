//! Fluent builder for [`Scheduler`] construction.

use crate::config::{Config, apply_env_overrides};
use crate::error::Result;
use crate::kernel::{Backend, DefaultBackend};
use crate::scheduler::Scheduler;

/// Builder for [`Scheduler`]s.
///
/// Values set here win over `KERNELQ_*` environment variables, which win
/// over [`Config::default()`].
///
/// # Example
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .event_capacity(256)
///     .execute_passes(1)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    event_capacity: Option<usize>,
    segment_capacity: Option<usize>,
    segment_limit: Option<usize>,
    execute_passes: Option<usize>,
    interrupt_retries: Option<usize>,
    ignore_env: bool,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel records collected per wait.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Size of the first task queue segment.
    pub fn segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = Some(capacity);
        self
    }

    /// Largest task queue segment.
    pub fn segment_limit(mut self, limit: usize) -> Self {
        self.segment_limit = Some(limit);
        self
    }

    pub fn execute_passes(mut self, passes: usize) -> Self {
        self.execute_passes = Some(passes);
        self
    }

    pub fn interrupt_retries(mut self, retries: usize) -> Self {
        self.interrupt_retries = Some(retries);
        self
    }

    /// Skips the `KERNELQ_*` environment variables.
    pub fn ignore_env(mut self) -> Self {
        self.ignore_env = true;
        self
    }

    /// Resolves the final configuration.
    pub fn config(&self) -> Result<Config> {
        let mut config = Config::default();

        if !self.ignore_env {
            apply_env_overrides(&mut config)?;
        }

        let overrides = [
            (self.event_capacity, &mut config.event_capacity),
            (self.segment_capacity, &mut config.segment_capacity),
            (self.segment_limit, &mut config.segment_limit),
            (self.execute_passes, &mut config.execute_passes),
            (self.interrupt_retries, &mut config.interrupt_retries),
        ];

        for (value, field) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }

        Ok(config)
    }

    /// Builds a scheduler on the platform's default backend.
    pub fn build(self) -> Result<Scheduler> {
        self.build_with::<DefaultBackend>()
    }

    /// Builds a scheduler on backend `B`.
    pub fn build_with<B: Backend>(self) -> Result<Scheduler<B>> {
        Scheduler::with_backend_config(self.config()?)
    }
}
