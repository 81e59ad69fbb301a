//! Links bind an [`Event`] to the task that runs when it fires.
//!
//! A link is the unit the scheduler dispatches and cancels. Its control
//! flags record where it is in its lifecycle; `executing` doubles as the
//! re-entrancy guard for [`Link::invoke`].

use crate::error::{Error, TaskError, TaskResult};
use crate::event::{AsEvent, Event};
use crate::taskq::Job;

use std::any::Any;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const CANCELLED: u8 = 1 << 0;
const DISPATCHED: u8 = 1 << 1;
const EXECUTING: u8 = 1 << 2;
const CYCLIC: u8 = 1 << 3;

/// Requested recurrence for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cyclic {
    /// Use the event kind's default.
    #[default]
    Inherit,
    /// Fire once, then tear the registration down.
    Never,
    /// Re-arm after every firing until cancelled.
    Always,
}

impl Cyclic {
    /// Resolves the request against what `event` can do.
    pub fn resolve(self, event: &Event) -> Result<bool, Error> {
        let kind = event.kind();

        match self {
            Self::Inherit => Ok(kind.cyclic_by_default()),
            Self::Never => Ok(false),
            Self::Always if kind.can_repeat() => Ok(true),
            Self::Always => Err(Error::NotCyclic { kind }),
        }
    }
}

impl From<i32> for Cyclic {
    fn from(flag: i32) -> Self {
        match flag {
            0 => Self::Never,
            flag if flag > 0 => Self::Always,
            _ => Self::Inherit,
        }
    }
}

type Callable = dyn Fn(&Link) -> TaskResult + Send + Sync;
type TrapHandler = dyn Fn(&Link, &Job, &TaskError) + Send + Sync;

/// What a link runs.
pub enum Task {
    /// Called with the link that fired.
    Call(Box<Callable>),
    /// Runs another link's task.
    Link(Arc<Link>),
    /// Exception trap handler: receives the failing job and its error.
    Trap(Box<TrapHandler>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(_) => f.write_str("Call"),
            Self::Link(link) => f.debug_tuple("Link").field(&Arc::as_ptr(link)).finish(),
            Self::Trap(_) => f.write_str("Trap"),
        }
    }
}

/// An event bound to a task and an optional context.
pub struct Link {
    event: Arc<Event>,
    task: Task,
    context: Option<Arc<dyn Any + Send + Sync>>,
    flags: AtomicU8,
}

impl Link {
    pub fn new<F>(event: Arc<Event>, task: F) -> Arc<Self>
    where
        F: Fn(&Link) -> TaskResult + Send + Sync + 'static,
    {
        Self::with_task(event, Task::Call(Box::new(task)), None)
    }

    pub fn with_context<F>(event: Arc<Event>, task: F, context: Arc<dyn Any + Send + Sync>) -> Arc<Self>
    where
        F: Fn(&Link) -> TaskResult + Send + Sync + 'static,
    {
        Self::with_task(event, Task::Call(Box::new(task)), Some(context))
    }

    /// A link whose task is `target`'s task.
    pub fn forward(event: Arc<Event>, target: Arc<Link>) -> Arc<Self> {
        Self::with_task(event, Task::Link(target), None)
    }

    /// A link suitable as the scheduler's exception trap.
    pub fn trap<F>(event: Arc<Event>, handler: F) -> Arc<Self>
    where
        F: Fn(&Link, &Job, &TaskError) + Send + Sync + 'static,
    {
        Self::with_task(event, Task::Trap(Box::new(handler)), None)
    }

    pub fn with_task(
        event: Arc<Event>,
        task: Task,
        context: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            event,
            task,
            context,
            flags: AtomicU8::new(0),
        })
    }

    /// The event this link is bound to.
    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn context(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.context.as_ref()
    }

    /// Runs the task with this link as its argument.
    ///
    /// # Errors
    ///
    /// [`Error::Reentrancy`] if the task is already running.
    pub fn invoke(&self) -> TaskResult {
        let _guard = self.enter()?;

        match &self.task {
            Task::Call(call) => call(self),
            Task::Link(target) => target.invoke(),
            Task::Trap(_) => Ok(()),
        }
    }

    /// Reports a failed job to this link's task.
    pub(crate) fn fault(&self, job: &Job, error: &TaskError) -> TaskResult {
        let _guard = self.enter()?;

        match &self.task {
            Task::Trap(handler) => {
                handler(self, job, error);
                Ok(())
            }
            Task::Call(call) => call(self),
            Task::Link(target) => target.fault(job, error),
        }
    }

    fn enter(&self) -> Result<ExecutingGuard<'_>, TaskError> {
        if self.flags.fetch_or(EXECUTING, Ordering::AcqRel) & EXECUTING != 0 {
            return Err(Error::Reentrancy.into());
        }

        Ok(ExecutingGuard(self))
    }

    /// Set once the link leaves the reference table: cancelled, replaced,
    /// retired after a one-shot firing, or released on close.
    pub fn is_cancelled(&self) -> bool {
        self.flag(CANCELLED)
    }

    /// Set by the first successful registration.
    pub fn is_dispatched(&self) -> bool {
        self.flag(DISPATCHED)
    }

    pub fn is_executing(&self) -> bool {
        self.flag(EXECUTING)
    }

    pub fn is_cyclic(&self) -> bool {
        self.flag(CYCLIC)
    }

    fn flag(&self, bit: u8) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    pub(crate) fn mark_dispatched(&self, cyclic: bool) {
        let set = DISPATCHED | if cyclic { CYCLIC } else { 0 };
        let clear = CANCELLED | if cyclic { 0 } else { CYCLIC };

        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                Some((flags & !clear) | set)
            });
    }

    pub(crate) fn mark_cancelled(&self) {
        self.flags.fetch_or(CANCELLED, Ordering::AcqRel);
    }
}

struct ExecutingGuard<'a>(&'a Link);

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.flags.fetch_and(!EXECUTING, Ordering::AcqRel);
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for Link {}

impl AsEvent for Link {
    fn as_event(&self) -> &Event {
        &self.event
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("event", &self.event)
            .field("task", &self.task)
            .field("cancelled", &self.is_cancelled())
            .field("dispatched", &self.is_dispatched())
            .field("executing", &self.is_executing())
            .field("cyclic", &self.is_cyclic())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn marker() -> Arc<Event> {
        Event::for_reference(EventKind::Never, Arc::new(()), None).unwrap()
    }

    #[test]
    fn test_new_link_has_no_flags() {
        let link = Link::new(marker(), |_| Ok(()));

        assert!(!link.is_cancelled());
        assert!(!link.is_dispatched());
        assert!(!link.is_executing());
        assert!(!link.is_cyclic());
    }

    #[test]
    fn test_invoke_passes_self() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = seen.clone();
        let link = Link::with_context(
            marker(),
            move |link| {
                assert!(link.is_executing());
                let value = link.context().and_then(|c| c.downcast_ref::<usize>()).copied();
                observer.store(value.unwrap_or(0), Ordering::SeqCst);
                Ok(())
            },
            Arc::new(42usize),
        );

        link.invoke().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert!(!link.is_executing());
    }

    #[test]
    fn test_reentrant_invoke_is_rejected() {
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        let link = Link::new(marker(), move |link| {
            *slot.lock().unwrap() = Some(link.invoke());
            Ok(())
        });

        link.invoke().unwrap();

        let result = nested.lock().unwrap().take().unwrap();
        assert!(matches!(
            result,
            Err(TaskError::Scheduler(Error::Reentrancy))
        ));
    }

    #[test]
    fn test_executing_cleared_after_panic() {
        let link = Link::new(marker(), |_| panic!("task blew up"));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| link.invoke()));

        assert!(outcome.is_err());
        assert!(!link.is_executing());
    }

    #[test]
    fn test_forward_runs_target() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let target = Link::new(marker(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let link = Link::forward(marker(), target);

        link.invoke().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_equality() {
        let event = marker();
        let a = Link::new(event.clone(), |_| Ok(()));
        let b = Link::new(event, |_| Ok(()));

        assert_eq!(*a, *a);
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_cyclic_resolution() {
        let timer = Event::for_duration(1).unwrap();
        let exit = Event::for_process_exit(std::process::id() as libc::pid_t, None).unwrap();

        assert!(!Cyclic::Inherit.resolve(&timer).unwrap());
        assert!(Cyclic::Always.resolve(&timer).unwrap());
        assert!(!Cyclic::Never.resolve(&exit).unwrap());
        assert!(matches!(
            Cyclic::Always.resolve(&exit),
            Err(Error::NotCyclic { kind: EventKind::ProcessExit })
        ));
        assert_eq!(Cyclic::from(-1), Cyclic::Inherit);
        assert_eq!(Cyclic::from(0), Cyclic::Never);
        assert_eq!(Cyclic::from(1), Cyclic::Always);
    }

    #[test]
    fn test_flag_transitions() {
        let link = Link::new(marker(), |_| Ok(()));

        link.mark_dispatched(true);
        assert!(link.is_dispatched() && link.is_cyclic());

        link.mark_cancelled();
        assert!(link.is_cancelled());

        link.mark_dispatched(false);
        assert!(!link.is_cancelled() && !link.is_cyclic());
    }
}
