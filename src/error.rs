//! Error types for the scheduler and the tasks it runs.
//!
//! Two families are kept apart:
//!
//! - [`Error`]: failures of the scheduler itself (kernel syscalls, allocation,
//!   misuse such as re-entrant invocation). These propagate to the caller of
//!   `dispatch`, `cancel`, `wait` and friends.
//! - [`TaskError`]: failures raised by user tasks while the task queue drains.
//!   These never abort the drain; they are routed to the exception trap or
//!   logged.

use crate::event::EventKind;

use std::any::Any;
use std::io;
use thiserror::Error;

/// Scheduler result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of a single task invocation.
pub type TaskResult = std::result::Result<(), TaskError>;

/// Errors reported by the kernel queue, task queue and scheduler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A kernel syscall (queue creation, registration, deletion, wait) failed.
    #[error("kernel {operation} failed: {source}")]
    KernelResource {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// A link's task was invoked while it was already executing.
    #[error("link task invoked while already executing")]
    Reentrancy,

    /// A task segment or registration table could not grow.
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// A repeating registration was requested for an event that fires once.
    #[error("{kind} events cannot be scheduled as cyclic")]
    NotCyclic { kind: EventKind },

    /// An event constructor was given a kind it does not build.
    #[error("{constructor} cannot build {kind} events")]
    InvalidKind {
        kind: EventKind,
        constructor: &'static str,
    },

    /// The active backend has no way to watch this kind of event.
    #[error("{kind} events are not supported by the {backend} backend")]
    Unsupported {
        kind: EventKind,
        backend: &'static str,
    },

    /// `meta_actuate` was dispatched twice.
    #[error("scheduler has already been actuated")]
    AlreadyActuated,

    /// The kernel queue root handle is closed.
    #[error("kernel queue is closed")]
    Closed,

    /// A configuration value could not be parsed.
    #[error("invalid value for {variable}: {value:?}")]
    Config { variable: &'static str, value: String },
}

impl Error {
    pub(crate) fn kernel(operation: &'static str, source: io::Error) -> Self {
        Self::KernelResource { operation, source }
    }

    /// The OS error code behind a [`Error::KernelResource`], if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::KernelResource { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Failure raised by a task during `execute`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The task returned an error.
    #[error("task failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The task panicked; the payload message is kept when it is a string.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task asked for the whole process to exit.
    #[error("task requested process exit with status {0}")]
    Exit(i32),

    /// An exit request that was refused and rewrapped.
    #[error("task attempted to terminate the process")]
    Terminated(#[source] Box<TaskError>),

    /// The scheduler refused to run the task.
    #[error(transparent)]
    Scheduler(#[from] Error),
}

impl TaskError {
    /// Wraps any error (or message) as a task failure.
    pub fn failed(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(error.into())
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "non-string panic payload".to_string(),
            },
        };

        Self::Panicked(message)
    }

    /// Exit requests are never honoured from inside the drain loop.
    pub(crate) fn contain(self) -> Self {
        match self {
            Self::Exit(_) => Self::Terminated(Box::new(self)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_is_rewrapped_with_cause() {
        let error = TaskError::Exit(3).contain();

        match &error {
            TaskError::Terminated(inner) => assert!(matches!(**inner, TaskError::Exit(3))),
            other => panic!("unexpected {other:?}"),
        }

        let source = std::error::Error::source(&error).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("task requested process exit with status 3"));
    }

    #[test]
    fn test_other_errors_pass_through() {
        assert!(matches!(
            TaskError::failed("boom").contain(),
            TaskError::Failed(_)
        ));
    }

    #[test]
    fn test_panic_payloads() {
        let from_str = TaskError::panicked(Box::new("static"));
        let from_string = TaskError::panicked(Box::new(String::from("owned")));
        let from_other = TaskError::panicked(Box::new(7u8));

        assert_eq!(from_str.to_string(), "task panicked: static");
        assert_eq!(from_string.to_string(), "task panicked: owned");
        assert_eq!(from_other.to_string(), "task panicked: non-string panic payload");
    }

    #[test]
    fn test_raw_os_error() {
        let error = Error::kernel("wait", io::Error::from_raw_os_error(libc::EBADF));
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));
        assert_eq!(Error::Closed.raw_os_error(), None);
    }
}
