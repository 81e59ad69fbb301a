//! Kernel event queue.
//!
//! [`KernelQueue`] arms [`Link`]s against the platform's event queue, waits
//! for them to fire and converts the raw kernel records back into links
//! queued on a [`TaskQueue`]. The platform specifics live behind the
//! [`Backend`] trait:
//! - [`epoll`]: Linux (`epoll` plus `timerfd`, `signalfd`, `pidfd`, `eventfd`
//!   and inotify handles)
//! - [`kqueue`]: macOS, iOS and FreeBSD
//!
//! Every registration carries the address of its link as the kernel's opaque
//! back-reference. The address stays valid because the link is held by the
//! reference table while registered, and by the cancellation list from the
//! moment it is unregistered until the next [`KernelQueue::transition`] has
//! consumed any record that was already collected for it.

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll as sys;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) use kqueue as sys;

#[cfg(target_os = "linux")]
pub type DefaultBackend = epoll::Epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub type DefaultBackend = kqueue::Kqueue;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKey, EventKind};
use crate::link::{Cyclic, Link};
use crate::signals::signal_name;
use crate::taskq::{Job, TaskQueue};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// How a raw kernel record should be handled by `transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The queue's own interrupt mechanism fired.
    Interrupt,
    /// A signal arrived on a subscription nobody claimed.
    Unclaimed(libc::c_int),
    /// Internal bookkeeping record with nothing to deliver.
    Ignored,
    /// A registration fired. `armed` is true when the kernel still holds the
    /// registration and a one-shot link must be deleted explicitly.
    Link { link: *const Link, armed: bool },
}

/// Platform event queue.
///
/// Implementations own the root kernel handle and translate [`Event`]s into
/// native registrations whose back-reference is the link's address.
pub trait Backend: Sized + Send + Sync {
    /// Raw record filled in by the wait syscall.
    type Record: Copy + Send;

    /// Value used to initialise the record buffer.
    const EMPTY: Self::Record;

    const NAME: &'static str;

    /// Allocates the root handle and the interrupt mechanism.
    fn open() -> io::Result<Self>;

    /// False once [`Backend::close`] or [`Backend::forget`] has run.
    fn is_open(&self) -> bool;

    /// Arms `link`'s event. `previous` is the link that held the same key
    /// until now, if any.
    fn register(&self, link: &Link, cyclic: bool, previous: Option<&Link>) -> Result<()>;

    /// Disarms `link`'s event. Registrations the kernel already removed are
    /// not an error.
    fn deregister(&self, link: &Link) -> io::Result<()>;

    /// Forces a blocked [`Backend::wait`] to return.
    fn interrupt(&self) -> io::Result<()>;

    /// Blocks until records are available or the timeout expires.
    fn wait(&self, records: &mut [Self::Record], timeout: Option<Duration>) -> io::Result<usize>;

    fn delivery(&self, record: &Self::Record) -> Delivery;

    /// Consumes level-triggered state for a link that fired so that it
    /// reports again only on the next kernel firing.
    fn acknowledge(&self, record: &Self::Record, link: &Link);

    /// Consumes an interrupt notification.
    fn acknowledge_interrupt(&self);

    /// Closes the root handle. Returns `false` if it was already closed.
    fn close(&self) -> io::Result<bool>;

    /// Forgets a root handle that was closed elsewhere, releasing only the
    /// auxiliary handles.
    fn forget(&self);
}

/// Timer units a kqueue timer filter may accept, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimerUnit {
    fn nanoseconds(self) -> u64 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => 1_000_000_000,
        }
    }

    /// Converts a duration to this unit, rounding up so that a non-zero
    /// duration never becomes a zero timer.
    pub fn convert(self, nanoseconds: u64) -> i64 {
        let value = nanoseconds.div_ceil(self.nanoseconds());
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

#[derive(Default)]
struct Registry {
    references: HashMap<EventKey, Arc<Link>>,
    cancellations: Vec<Arc<Link>>,
}

struct EventBuffer<R> {
    records: Vec<R>,
    cursor: usize,
    count: usize,
}

/// Cross-platform kernel event queue.
pub struct KernelQueue<B: Backend = DefaultBackend> {
    backend: B,
    registry: Mutex<Registry>,
    buffer: Mutex<EventBuffer<B::Record>>,
    interrupt_retries: usize,
}

impl<B: Backend> KernelQueue<B> {
    /// Opens the platform queue with a record buffer of
    /// `config.event_capacity` entries (at least one).
    ///
    /// # Errors
    /// [`Error::KernelResource`] if the root handle or the interrupt
    /// mechanism cannot be allocated. Anything acquired before the failure
    /// is released first.
    pub fn open(config: &Config) -> Result<Self> {
        let backend = B::open().map_err(|e| Error::kernel("queue creation", e))?;
        let capacity = config.event_capacity.max(1);

        tracing::debug!(backend = B::NAME, capacity, "kernel queue opened");

        Ok(Self {
            backend,
            registry: Mutex::new(Registry::default()),
            buffer: Mutex::new(EventBuffer {
                records: vec![B::EMPTY; capacity],
                cursor: 0,
                count: 0,
            }),
            interrupt_retries: config.interrupt_retries,
        })
    }

    /// Whether the root handle has been closed, voided or lost to `EBADF`.
    pub fn is_closed(&self) -> bool {
        !self.backend.is_open()
    }

    /// The platform backend under this queue.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Arms `link`'s event in the kernel.
    ///
    /// The reference table is updated before the syscall; a failed
    /// registration restores whatever link held the key before.
    pub fn schedule(&self, link: &Arc<Link>, cyclic: Cyclic) -> Result<()> {
        let event = link.event();
        let cyclic = cyclic.resolve(event)?;

        if event.kind() == EventKind::MetaException {
            return Err(Error::Unsupported {
                kind: event.kind(),
                backend: B::NAME,
            });
        }

        let key = event.key();
        let mut registry = self.registry.lock();

        if self.is_closed() {
            return Err(Error::Closed);
        }

        registry
            .references
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("reference table"))?;
        registry
            .cancellations
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("cancellation list"))?;

        let previous = registry.references.insert(key.clone(), link.clone());
        if let Some(previous) = &previous {
            registry.cancellations.push(previous.clone());
        }

        match self.backend.register(link, cyclic, previous.as_deref()) {
            Ok(()) => {
                link.mark_dispatched(cyclic);
                if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, link)) {
                    previous.mark_cancelled();
                }

                tracing::debug!(kind = %event.kind(), id = event.id(), cyclic, "scheduled");
                Ok(())
            }
            Err(error) => {
                match previous {
                    Some(previous) => registry.references.insert(key, previous),
                    None => registry.references.remove(&key),
                };

                Err(error)
            }
        }
    }

    /// Disarms the registration for `event`. Unknown events are a no-op.
    pub fn cancel(&self, event: &Event) -> Result<()> {
        let key = event.key();
        let mut registry = self.registry.lock();

        let Some(link) = registry.references.get(&key).cloned() else {
            return Ok(());
        };

        registry
            .cancellations
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory("cancellation list"))?;
        registry.cancellations.push(link.clone());
        registry.references.remove(&key);

        match self.backend.deregister(&link) {
            Ok(()) => {
                link.mark_cancelled();
                tracing::debug!(kind = %event.kind(), id = event.id(), "cancelled");
                Ok(())
            }
            Err(error) => {
                if registry.references.try_reserve(1).is_ok() {
                    registry.references.insert(key, link);
                } else {
                    // The kernel may still deliver this address; keep it alive forever.
                    tracing::error!(
                        kind = %event.kind(),
                        id = event.id(),
                        %error,
                        "could not restore registration after failed delete, leaking link"
                    );
                    std::mem::forget(link);
                }

                Err(Error::kernel("delete", error))
            }
        }
    }

    /// Forces a concurrent [`KernelQueue::receive`] to return.
    pub fn interrupt(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        self.backend
            .interrupt()
            .map_err(|e| Error::kernel("interrupt", e))
    }

    /// Waits for kernel records, replacing the buffer contents.
    ///
    /// `None` blocks until something fires. `EINTR` is retried up to the
    /// configured budget. `EBADF` means the root handle was closed from
    /// elsewhere; the queue is marked closed and nothing is reported.
    ///
    /// Records from an earlier call that have not been through
    /// [`KernelQueue::transition`] yet are kept: the call returns their count
    /// immediately instead of waiting. One-shot registrations are already
    /// disarmed by the kernel at that point, so overwriting them would strand
    /// their links.
    ///
    /// # Returns
    /// The number of records waiting for `transition`.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut buffer = self.buffer.lock();
        let mut retries = 0;

        if buffer.cursor < buffer.count && !self.is_closed() {
            let pending = buffer.count - buffer.cursor;
            tracing::trace!(pending, "records still buffered, skipping wait");
            return Ok(pending);
        }

        buffer.cursor = 0;
        buffer.count = 0;

        let count = loop {
            match self.backend.wait(&mut buffer.records, timeout) {
                Ok(count) => break count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted && retries < self.interrupt_retries => {
                    retries += 1;
                }
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                    tracing::debug!("kernel queue closed during wait");
                    self.backend.forget();
                    return Ok(0);
                }
                Err(e) => return Err(Error::kernel("wait", e)),
            }
        };

        buffer.count = count;
        tracing::trace!(count, "received kernel records");

        Ok(count)
    }

    /// Queues the links behind the last received records onto `tasks`.
    ///
    /// Records are handled in kernel order. One-shot links are removed from
    /// the reference table as they fire. Returns the number of records
    /// processed.
    pub fn transition(&self, tasks: &TaskQueue) -> Result<usize> {
        let mut buffer = self.buffer.lock();
        let mut fired = Vec::with_capacity(buffer.count - buffer.cursor);
        let processed;

        {
            let mut registry = self.registry.lock();

            // Records collected before a void may name links that were released.
            if self.is_closed() {
                buffer.cursor = 0;
                buffer.count = 0;
                return Ok(0);
            }

            let start = buffer.cursor;
            let end = buffer.count;

            for record in &buffer.records[start..end] {
                match self.backend.delivery(record) {
                    Delivery::Interrupt => self.backend.acknowledge_interrupt(),
                    Delivery::Ignored => {}
                    Delivery::Unclaimed(signo) => {
                        tracing::debug!(
                            signo,
                            signal = signal_name(signo).unwrap_or("unknown"),
                            "unclaimed signal"
                        );
                    }
                    Delivery::Link { link, armed } => {
                        // SAFETY: every address handed to the kernel belongs to a
                        // link held by `references` or `cancellations`, and neither
                        // releases it while the registry lock is held.
                        let link = unsafe {
                            Arc::increment_strong_count(link);
                            Arc::from_raw(link)
                        };

                        self.backend.acknowledge(record, &link);
                        tracing::trace!(kind = %link.event().kind(), id = link.event().id(), "fired");

                        if !link.is_cyclic() {
                            Self::retire(&self.backend, &mut registry, &link, armed);
                        }

                        fired.push(link);
                    }
                }
            }

            processed = end - start;
            buffer.cursor = end;
            registry.cancellations.clear();
        }

        drop(buffer);

        for link in fired {
            if let Err(error) = tasks.enqueue(Job::Link(link)) {
                tracing::error!(%error, "dropped fired link");
            }
        }

        Ok(processed)
    }

    fn retire(backend: &B, registry: &mut Registry, link: &Arc<Link>, armed: bool) {
        let key = link.event().key();

        let current = registry
            .references
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, link));
        if !current {
            return;
        }

        if armed && let Err(error) = backend.deregister(link) {
            tracing::warn!(kind = %key.kind(), %error, "failed to delete one-shot registration");
        }

        registry.references.remove(&key);
        link.mark_cancelled();
    }

    /// Closes the root handle. On the first close every registered link is
    /// released and the `meta_terminate` ones are queued on `tasks`.
    pub fn close(&self, tasks: &TaskQueue) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }

        let _ = self.backend.interrupt();
        let mut buffer = self.buffer.lock();
        buffer.cursor = 0;
        buffer.count = 0;

        let mut registry = self.registry.lock();
        let closed = self
            .backend
            .close()
            .map_err(|e| Error::kernel("close", e))?;
        if !closed {
            return Ok(false);
        }

        let released = std::mem::take(&mut registry.references);
        registry.cancellations.clear();
        drop(registry);
        drop(buffer);

        let mut terminations = 0;
        for (_, link) in released {
            link.mark_cancelled();

            if link.event().kind() == EventKind::MetaTerminate {
                terminations += 1;
                if let Err(error) = tasks.enqueue(Job::Link(link)) {
                    tracing::error!(%error, "dropped termination notice");
                }
            }
        }

        tracing::debug!(terminations, "kernel queue closed");

        Ok(true)
    }

    /// Drops every registration and the root handle without talking to the
    /// kernel about individual registrations. Used after `fork`, where the
    /// inherited registrations belong to the parent.
    ///
    /// Nothing is written to the inherited handles: the interrupt mechanism
    /// is shared with the parent after a fork, so signalling it would wake the
    /// parent's queue. A thread blocked in [`KernelQueue::receive`] is not
    /// woken either; records it collects are discarded by the next
    /// `transition`.
    pub fn void(&self) {
        // A waiter that existed before fork holds the buffer lock forever.
        if let Some(mut buffer) = self.buffer.try_lock() {
            buffer.cursor = 0;
            buffer.count = 0;
        }

        let mut registry = self.registry.lock();
        if let Err(error) = self.backend.close() {
            tracing::warn!(%error, "failed to close kernel queue handles");
        }
        let released = std::mem::take(&mut *registry);
        drop(registry);

        for link in released.references.into_values() {
            link.mark_cancelled();
        }
    }

    /// Whether a link is currently registered for `event`'s key.
    pub fn is_scheduled(&self, event: &Event) -> bool {
        self.registry.lock().references.contains_key(&event.key())
    }

    /// The link currently registered for `event`.
    pub fn registered(&self, event: &Event) -> Option<Arc<Link>> {
        self.registry.lock().references.get(&event.key()).cloned()
    }

    /// Number of live registrations.
    pub fn scheduled(&self) -> usize {
        self.registry.lock().references.len()
    }

    /// Records received but not yet transitioned.
    pub fn buffered(&self) -> usize {
        let buffer = self.buffer.lock();
        buffer.count - buffer.cursor
    }

    /// Size of the record buffer, the most records a single `receive` can
    /// collect.
    pub fn capacity(&self) -> usize {
        self.buffer.lock().records.len()
    }
}

impl<B: Backend> Drop for KernelQueue<B> {
    fn drop(&mut self) {
        if self.backend.is_open() {
            tracing::warn!(
                backend = B::NAME,
                registrations = self.registry.get_mut().references.len(),
                "kernel queue dropped without being closed"
            );
            self.void();
        }
    }
}

impl<B: Backend> fmt::Debug for KernelQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelQueue")
            .field("backend", &B::NAME)
            .field("closed", &self.is_closed())
            .field("scheduled", &self.scheduled())
            .field("buffered", &self.buffered())
            .finish()
    }
}
