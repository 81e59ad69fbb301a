//! Double-buffered FIFO queue of deferred tasks.
//!
//! Tasks accumulate in the *loading* chain. [`TaskQueue::cycle`] promotes the
//! loading chain to *executing* and starts a fresh loading chain.
//! [`TaskQueue::execute`] detaches the executing chain before running anything,
//! so tasks that enqueue more tasks only ever touch the loading chain.
//!
//! A chain is a sequence of segments. Each new segment doubles the capacity of
//! the previous one up to a cap, so appends never move queued tasks and the
//! waste is bounded by one nearly-empty segment of maximum size.

use crate::error::{Error, Result, TaskError, TaskResult};
use crate::link::Link;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub const DEFAULT_SEGMENT_CAPACITY: usize = 4;
pub const DEFAULT_SEGMENT_LIMIT: usize = 128;

/// A queued unit of work.
pub enum Job {
    /// Invoke a link (the usual product of a kernel event).
    Link(Arc<Link>),
    /// A plain closure submitted directly.
    Call(Box<dyn FnMut() -> TaskResult + Send>),
}

impl Job {
    pub fn call<F>(task: F) -> Self
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        Self::Call(Box::new(task))
    }

    pub fn link(&self) -> Option<&Arc<Link>> {
        match self {
            Self::Link(link) => Some(link),
            Self::Call(_) => None,
        }
    }

    /// Runs the job, turning a panic into a [`TaskError::Panicked`].
    pub(crate) fn run(&mut self) -> TaskResult {
        catch_unwind(AssertUnwindSafe(|| match self {
            Self::Link(link) => link.invoke(),
            Self::Call(call) => call(),
        }))
        .unwrap_or_else(|payload| Err(TaskError::panicked(payload)))
    }
}

impl From<Arc<Link>> for Job {
    fn from(link: Arc<Link>) -> Self {
        Self::Link(link)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(link) => f.debug_tuple("Link").field(link).finish(),
            Self::Call(_) => f.write_str("Call"),
        }
    }
}

struct Segment {
    jobs: Vec<Job>,
    capacity: usize,
}

impl Segment {
    fn allocate(capacity: usize) -> Result<Self> {
        let mut jobs = Vec::new();
        jobs.try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory("task segment"))?;

        Ok(Self { jobs, capacity })
    }

    fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }
}

#[derive(Default)]
struct Chain {
    segments: VecDeque<Segment>,
    len: usize,
}

impl Chain {
    fn with_segment(capacity: usize) -> Result<Self> {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::allocate(capacity)?);

        Ok(Self { segments, len: 0 })
    }

    fn push(&mut self, job: Job, initial: usize, limit: usize) -> Result<()> {
        let grow = match self.segments.back() {
            Some(tail) if tail.is_full() => Some((tail.capacity * 2).min(limit)),
            Some(_) => None,
            None => Some(initial),
        };

        if let Some(capacity) = grow {
            let segment = Segment::allocate(capacity)?;
            self.segments
                .try_reserve(1)
                .map_err(|_| Error::OutOfMemory("task segment chain"))?;
            self.segments.push_back(segment);
        }

        if let Some(tail) = self.segments.back_mut() {
            tail.jobs.push(job);
            self.len += 1;
        }

        Ok(())
    }

    fn append(&mut self, other: Chain) {
        self.len += other.len;
        self.segments.extend(other.segments.into_iter().filter(|s| !s.jobs.is_empty()));
    }

    fn capacities(&self) -> Vec<usize> {
        self.segments.iter().map(|s| s.capacity).collect()
    }
}

struct Buffers {
    executing: Chain,
    loading: Chain,
}

/// FIFO queue of [`Job`]s with separate loading and executing chains.
pub struct TaskQueue {
    buffers: Mutex<Buffers>,
    initial: usize,
    limit: usize,
}

impl TaskQueue {
    /// Creates a queue with the default segment sizes.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_SEGMENT_CAPACITY, DEFAULT_SEGMENT_LIMIT)
    }

    /// Creates a queue whose first segment holds `initial` jobs and whose
    /// segments never exceed `limit` jobs.
    pub fn with_capacity(initial: usize, limit: usize) -> Result<Self> {
        let initial = initial.max(1);
        let limit = limit.max(initial);

        Ok(Self {
            buffers: Mutex::new(Buffers {
                executing: Chain::default(),
                loading: Chain::with_segment(initial)?,
            }),
            initial,
            limit,
        })
    }

    /// Appends a job to the loading chain.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] if a new segment was needed and could not be
    /// allocated; the job is dropped and the queue is left as it was.
    pub fn enqueue(&self, job: impl Into<Job>) -> Result<()> {
        self.buffers
            .lock()
            .loading
            .push(job.into(), self.initial, self.limit)
    }

    /// Promotes the loading chain to executing and starts a new loading chain.
    pub fn cycle(&self) -> Result<()> {
        let fresh = Chain::with_segment(self.initial)?;
        let mut buffers = self.buffers.lock();
        let loaded = mem::replace(&mut buffers.loading, fresh);
        buffers.executing.append(loaded);

        Ok(())
    }

    /// Drains the executing chain, returning the number of jobs run.
    ///
    /// A failing job never stops the drain. Its error goes to `handler` when
    /// given, otherwise it is logged. Afterwards, anything loaded meanwhile is
    /// promoted so the next call runs it.
    pub fn execute(&self, mut handler: Option<&mut dyn FnMut(&Job, TaskError)>) -> usize {
        let chain = mem::take(&mut self.buffers.lock().executing);
        let mut count = 0;

        for segment in chain.segments {
            for mut job in segment.jobs {
                count += 1;

                if let Err(error) = job.run() {
                    let error = error.contain();

                    match handler.as_deref_mut() {
                        Some(handler) => handler(&job, error),
                        None => tracing::error!(?job, %error, "unhandled task failure"),
                    }
                }
            }
        }

        if self.has_loaded()
            && let Err(error) = self.cycle()
        {
            tracing::warn!(%error, "task queue cycle deferred");
        }

        count
    }

    /// Jobs waiting in either chain.
    pub fn len(&self) -> usize {
        let buffers = self.buffers.lock();
        buffers.executing.len + buffers.loading.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the executing chain has jobs ready to drain.
    pub fn has_executable(&self) -> bool {
        self.buffers.lock().executing.len > 0
    }

    /// Whether the loading chain has accumulated jobs.
    pub fn has_loaded(&self) -> bool {
        self.buffers.lock().loading.len > 0
    }

    /// Releases every queued job without running it.
    pub fn clear(&self) -> Result<()> {
        let fresh = Chain::with_segment(self.initial)?;
        let (executing, loading) = {
            let mut buffers = self.buffers.lock();
            (
                mem::take(&mut buffers.executing),
                mem::replace(&mut buffers.loading, fresh),
            )
        };

        drop(executing);
        drop(loading);

        Ok(())
    }

    #[cfg(test)]
    fn loading_capacities(&self) -> Vec<usize> {
        self.buffers.lock().loading.capacities()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffers = self.buffers.lock();
        f.debug_struct("TaskQueue")
            .field("executing", &buffers.executing.len)
            .field("loading", &buffers.loading.len)
            .field("segments", &buffers.loading.capacities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<StdMutex<Vec<usize>>>, value: usize) -> Job {
        let log = log.clone();
        Job::call(move || {
            log.lock().unwrap().push(value);
            Ok(())
        })
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new().unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));

        for value in [1, 2, 3] {
            queue.enqueue(recorder(&log, value)).unwrap();
        }

        queue.cycle().unwrap();
        assert_eq!(queue.execute(None), 3);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_segments_double_up_to_limit() {
        let queue = TaskQueue::with_capacity(4, 128).unwrap();

        for _ in 0..200 {
            queue.enqueue(Job::call(|| Ok(()))).unwrap();
        }

        assert_eq!(queue.loading_capacities(), vec![4, 8, 16, 32, 64, 128]);
        assert_eq!(queue.len(), 200);

        queue.cycle().unwrap();
        assert_eq!(queue.execute(None), 200);
        assert_eq!(queue.loading_capacities(), vec![4]);
    }

    #[test]
    fn test_execute_without_cycle_runs_nothing() {
        let queue = TaskQueue::new().unwrap();
        queue.enqueue(Job::call(|| Ok(()))).unwrap();

        assert!(!queue.has_executable());
        assert_eq!(queue.execute(None), 0);
        assert!(queue.has_executable());
        assert_eq!(queue.execute(None), 1);
    }

    #[test]
    fn test_enqueue_during_execute_lands_in_next_drain() {
        let queue = Arc::new(TaskQueue::new().unwrap());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_log = log.clone();
        queue
            .enqueue(Job::call(move || {
                inner_log.lock().unwrap().push(1);
                inner_queue.enqueue(recorder(&inner_log, 2))?;
                Ok(())
            }))
            .unwrap();

        queue.cycle().unwrap();
        assert_eq!(queue.execute(None), 1);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        assert_eq!(queue.execute(None), 1);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_failures_go_to_handler_and_drain_continues() {
        let queue = TaskQueue::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Job::call(|| Err(TaskError::failed("first")))).unwrap();
        queue.enqueue(Job::call(|| panic!("second"))).unwrap();
        let counter = ran.clone();
        queue
            .enqueue(Job::call(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        let mut errors = Vec::new();
        let mut handler = |_: &Job, error: TaskError| errors.push(error.to_string());

        queue.cycle().unwrap();
        assert_eq!(queue.execute(Some(&mut handler)), 3);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(
            errors,
            vec!["task failed: first".to_string(), "task panicked: second".to_string()]
        );
    }

    #[test]
    fn test_exit_requests_are_contained() {
        let queue = TaskQueue::new().unwrap();
        queue.enqueue(Job::call(|| Err(TaskError::Exit(1)))).unwrap();

        let mut seen = None;
        let mut handler = |_: &Job, error: TaskError| seen = Some(error);

        queue.cycle().unwrap();
        queue.execute(Some(&mut handler));

        assert!(matches!(seen, Some(TaskError::Terminated(_))));
    }

    #[test]
    fn test_clear_releases_jobs() {
        let queue = TaskQueue::new().unwrap();
        let token = Arc::new(());

        for _ in 0..10 {
            let held = token.clone();
            queue
                .enqueue(Job::call(move || {
                    let _ = &held;
                    Ok(())
                }))
                .unwrap();
        }

        assert_eq!(Arc::strong_count(&token), 11);
        queue.clear().unwrap();
        assert_eq!(Arc::strong_count(&token), 1);
        assert!(queue.is_empty());
    }
}
