//! The scheduler façade.
//!
//! Joins a [`KernelQueue`] and a [`TaskQueue`]: links are dispatched into the
//! kernel queue, `wait` moves the ones that fired onto the task queue, and
//! `execute` runs them. Failed tasks are routed to the exception trap, a link
//! installed by dispatching a `meta_exception` event.

use crate::config::Config;
use crate::error::{Error, Result, TaskError};
use crate::event::{AsEvent, EventKind};
use crate::kernel::{Backend, DefaultBackend, KernelQueue};
use crate::link::{Cyclic, Link};
use crate::taskq::{Job, TaskQueue};

use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Event scheduler over the platform's kernel event queue.
///
/// # Example
/// ```ignore
/// let scheduler = Scheduler::new()?;
/// let timer = Event::for_duration(1_000_000)?;
/// scheduler.dispatch(Link::new(timer, |_| Ok(())), Cyclic::Inherit)?;
///
/// while scheduler.wait(-10)? == 0 {}
/// scheduler.execute()?;
/// ```
pub struct Scheduler<B: Backend = DefaultBackend> {
    kernel: KernelQueue<B>,
    tasks: TaskQueue,
    trap: Mutex<Option<Arc<Link>>>,
    waiting: AtomicBool,
    actuated: AtomicBool,
    config: Config,
}

impl Scheduler {
    /// A scheduler on the default backend, configured from defaults and the
    /// `KERNELQ_*` environment.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::from_env()?)
    }

    /// A scheduler on the default backend with an explicit configuration.
    /// The environment is not consulted.
    ///
    /// # Arguments
    /// * `config` - queue sizes and limits; zero sizes are clamped to one
    ///
    /// # Example
    /// ```ignore
    /// let scheduler = Scheduler::with_config(Config::default())?;
    /// ```
    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_backend_config(config)
    }
}

impl<B: Backend> Scheduler<B> {
    /// A scheduler on backend `B`, e.g. `Scheduler::<Epoll>::with_backend_config`.
    pub fn with_backend_config(config: Config) -> Result<Self> {
        let config = config.normalized();
        let tasks = TaskQueue::with_capacity(config.segment_capacity, config.segment_limit)?;
        let kernel = KernelQueue::open(&config)?;

        Ok(Self {
            kernel,
            tasks,
            trap: Mutex::new(None),
            waiting: AtomicBool::new(false),
            actuated: AtomicBool::new(false),
            config,
        })
    }

    /// Schedules `link` and hands it back.
    ///
    /// A `meta_exception` link becomes the exception trap instead of being
    /// registered. A `meta_actuate` link is accepted once per scheduler.
    pub fn dispatch(&self, link: Arc<Link>, cyclic: Cyclic) -> Result<Arc<Link>> {
        match link.event().kind() {
            EventKind::MetaException => {
                link.mark_dispatched(false);
                if let Some(previous) = self.trap.lock().replace(link.clone()) {
                    previous.mark_cancelled();
                }

                tracing::debug!("exception trap installed");
                Ok(link)
            }
            EventKind::MetaActuate => {
                if self.kernel.is_closed() {
                    return Err(Error::Closed);
                }
                if self.actuated.swap(true, Ordering::AcqRel) {
                    return Err(Error::AlreadyActuated);
                }

                if let Err(error) = self.kernel.schedule(&link, cyclic) {
                    self.actuated.store(false, Ordering::Release);
                    return Err(error);
                }

                Ok(link)
            }
            _ => {
                self.kernel.schedule(&link, cyclic)?;
                Ok(link)
            }
        }
    }

    /// Cancels whatever is scheduled for `target`'s event.
    pub fn cancel<E: AsEvent + ?Sized>(&self, target: &E) -> Result<()> {
        let event = target.as_event();

        if event.kind() == EventKind::MetaException {
            let mut trap = self.trap.lock();
            if trap.as_ref().is_some_and(|trap| trap.event().key() == event.key())
                && let Some(trap) = trap.take()
            {
                trap.mark_cancelled();
            }
            return Ok(());
        }

        self.kernel.cancel(event)
    }

    /// Waits for kernel events and queues the tasks of the ones that fired.
    ///
    /// `timeout` is in seconds; a negative value is a short wait of that many
    /// milliseconds. When tasks are already pending the kernel is only
    /// polled. Returns the number of kernel records processed.
    pub fn wait(&self, timeout: i64) -> Result<usize> {
        let timeout = if timeout < 0 {
            Duration::from_millis(timeout.unsigned_abs())
        } else {
            Duration::from_secs(timeout.unsigned_abs())
        };

        self.wait_for(Some(timeout))
    }

    /// Like [`Scheduler::wait`] with an exact timeout; `None` blocks until
    /// something fires or the scheduler is interrupted.
    pub fn wait_for(&self, timeout: Option<Duration>) -> Result<usize> {
        if self.kernel.is_closed() {
            return Err(Error::Closed);
        }

        let timeout = if self.has_pending_tasks() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        self.waiting.store(true, Ordering::Release);
        let received = self.kernel.receive(timeout);
        self.waiting.store(false, Ordering::Release);
        received?;

        self.kernel.transition(&self.tasks)
    }

    /// Runs queued tasks, re-draining what they queue up to the configured
    /// number of passes. Returns the number of tasks run.
    pub fn execute(&self) -> Result<usize> {
        let mut route = |job: &Job, error: TaskError| self.fault(job, error);
        let mut total = 0;

        for _ in 0..self.config.execute_passes {
            if !self.tasks.has_executable() {
                if !self.tasks.has_loaded() {
                    break;
                }
                self.tasks.cycle()?;
            }

            total += self.tasks.execute(Some(&mut route));
        }

        Ok(total)
    }

    fn fault(&self, job: &Job, error: TaskError) {
        let trap = self.trap.lock().clone();

        let Some(trap) = trap else {
            tracing::error!(?job, %error, "unhandled task failure");
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| trap.fault(job, &error)))
            .unwrap_or_else(|payload| Err(TaskError::panicked(payload)));

        if let Err(failure) = outcome {
            tracing::error!(?job, %error, %failure, "exception trap failed");
        }
    }

    /// Queues a job directly, without a kernel event.
    pub fn enqueue(&self, job: impl Into<Job>) -> Result<()> {
        self.tasks.enqueue(job)
    }

    /// Wakes a concurrent [`Scheduler::wait`]. Returns whether one was in
    /// progress.
    pub fn interrupt(&self) -> Result<bool> {
        let waiting = self.waiting.load(Ordering::Acquire);
        self.kernel.interrupt()?;
        Ok(waiting)
    }

    /// Closes the kernel queue, queueing the `meta_terminate` links on the
    /// first close. Returns `false` if already closed.
    pub fn close(&self) -> Result<bool> {
        self.kernel.close(&self.tasks)
    }

    /// Drops every registration without notifying anyone.
    pub fn void(&self) {
        self.kernel.void();
    }

    /// Whether `target`'s event is registered, or installed as the
    /// exception trap.
    pub fn is_scheduled<E: AsEvent + ?Sized>(&self, target: &E) -> bool {
        let event = target.as_event();

        if event.kind() == EventKind::MetaException {
            return self
                .trap
                .lock()
                .as_ref()
                .is_some_and(|trap| trap.event().key() == event.key());
        }

        self.kernel.is_scheduled(event)
    }

    /// Whether any task is loaded or waiting to run.
    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.kernel.is_closed()
    }

    /// Whether a [`Scheduler::wait`] is blocked in the kernel right now.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// The kernel queue, for callers that drive `receive` and `transition`
    /// themselves.
    pub fn kernel(&self) -> &KernelQueue<B> {
        &self.kernel
    }

    /// The task queue fed by [`Scheduler::wait`].
    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    /// The normalized configuration this scheduler was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<B: Backend> fmt::Debug for Scheduler<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("kernel", &self.kernel)
            .field("tasks", &self.tasks)
            .field("trap", &self.trap.lock().is_some())
            .field("waiting", &self.is_waiting())
            .finish()
    }
}
