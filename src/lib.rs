//! Event scheduler over the kernel's native event queue.
//!
//! Applications describe what to wait for as [`Event`]s, bind them to tasks
//! with [`Link`]s and hand them to a [`Scheduler`]. The scheduler registers
//! them with kqueue or epoll, collects the ones that fire and runs their tasks
//! in FIFO batches.
//!
//! # Architecture
//!
//! - **Event**: a condition to wait for (timer, process exit, signal, I/O
//!   readiness, file change, application marker)
//! - **Link**: an event bound to a task, with lifecycle flags
//! - **KernelQueue**: registrations, kernel waits and the translation of
//!   kernel records back into links, over a platform [`Backend`]
//! - **TaskQueue**: double-buffered segmented FIFO of [`Job`]s; jobs queued
//!   while a batch runs wait for the next batch
//! - **Scheduler**: the façade joining the two queues, with the exception trap
//! - **SchedulerBuilder**: fluent construction over [`Config`]
//!
//! # Example
//! ```ignore
//! use kernelq::{Cyclic, Event, Link, Scheduler};
//!
//! let scheduler = Scheduler::new()?;
//! let tick = Event::for_duration(10_000_000)?;
//! scheduler.dispatch(Link::new(tick, |_| Ok(())), Cyclic::Always)?;
//!
//! loop {
//!     scheduler.wait(1)?;
//!     scheduler.execute()?;
//! }
//! ```

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
compile_error!("kernelq supports Linux (epoll) and macOS, iOS and FreeBSD (kqueue)");

mod builder;
mod config;
mod error;
mod event;
pub mod kernel;
mod link;
mod scheduler;
mod signals;
mod taskq;

pub use builder::SchedulerBuilder;
pub use config::{Config, apply_env_overrides, apply_env_overrides_from};
pub use error::{Error, Result, TaskError, TaskResult};
pub use event::{AsEvent, Event, EventKey, EventKind, EventResource, KernelHandle, ResourceKind};
pub use kernel::{Backend, DefaultBackend, KernelQueue};
pub use link::{Cyclic, Link, Task};
pub use scheduler::Scheduler;
pub use signals::signal_name;
pub use taskq::{Job, TaskQueue};
