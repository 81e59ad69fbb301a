//! Event descriptors: the "when" half of a scheduled operation.
//!
//! An [`Event`] names a condition to wait for (a timer, a signal, a process
//! exit, I/O readiness, a filesystem change, or an application marker) and,
//! on platforms that need one, owns the kernel handle that backs it
//! (`timerfd`, `signalfd`, `pidfd`, `eventfd`, inotify on Linux; a vnode
//! descriptor on kqueue platforms).
//!
//! Events are immutable once built and are shared through `Arc`. Two events
//! identify the same registration when their [`EventKey`] matches; timers are
//! the exception and only ever match themselves.

use crate::error::{Error, Result};
use crate::kernel::sys;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// Identifier 0 is reserved for the kqueue interrupt registration.
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// The condition an [`Event`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Never,
    MetaActuate,
    MetaTerminate,
    MetaException,
    ProcessExit,
    ProcessSignal,
    Time,
    IoReceive,
    IoTransmit,
    IoStatus,
    FsVoid,
    FsDelta,
    FsStatus,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::MetaActuate => "meta_actuate",
            Self::MetaTerminate => "meta_terminate",
            Self::MetaException => "meta_exception",
            Self::ProcessExit => "process_exit",
            Self::ProcessSignal => "process_signal",
            Self::Time => "time",
            Self::IoReceive => "io_receive",
            Self::IoTransmit => "io_transmit",
            Self::IoStatus => "io_status",
            Self::FsVoid => "fs_void",
            Self::FsDelta => "fs_delta",
            Self::FsStatus => "fs_status",
        }
    }

    pub fn is_meta(self) -> bool {
        matches!(
            self,
            Self::Never | Self::MetaActuate | Self::MetaTerminate | Self::MetaException
        )
    }

    pub fn is_io(self) -> bool {
        matches!(self, Self::IoReceive | Self::IoTransmit | Self::IoStatus)
    }

    pub fn is_fs(self) -> bool {
        matches!(self, Self::FsVoid | Self::FsDelta | Self::FsStatus)
    }

    /// Whether a registration of this kind re-arms after firing when the
    /// caller does not say otherwise.
    pub fn cyclic_by_default(self) -> bool {
        matches!(self, Self::ProcessSignal) || self.is_io() || self.is_fs()
    }

    /// Kinds that structurally fire at most once.
    pub fn can_repeat(self) -> bool {
        !matches!(self, Self::ProcessExit | Self::MetaActuate)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the event's resource is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    None,
    KernelHandle,
    ObjectPair,
    RawIdentifier,
}

/// The resource an event is keyed on.
#[derive(Clone)]
pub enum EventResource {
    None,
    /// Timer period in nanoseconds.
    Duration(u64),
    Process { pid: libc::pid_t },
    Signal { signo: libc::c_int },
    Reference(Arc<dyn Any + Send + Sync>),
    Path(PathBuf),
    /// Borrowed I/O descriptors; the I/O layer owns them.
    Io {
        port: RawFd,
        correlation: Option<RawFd>,
    },
}

impl fmt::Debug for EventResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Duration(ns) => f.debug_tuple("Duration").field(ns).finish(),
            Self::Process { pid } => f.debug_struct("Process").field("pid", pid).finish(),
            Self::Signal { signo } => f.debug_struct("Signal").field("signo", signo).finish(),
            Self::Reference(object) => f
                .debug_tuple("Reference")
                .field(&Arc::as_ptr(object).cast::<()>())
                .finish(),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Io { port, correlation } => f
                .debug_struct("Io")
                .field("port", port)
                .field("correlation", correlation)
                .finish(),
        }
    }
}

/// Identity of a registration in the kernel queue's reference table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    kind: EventKind,
    ident: KeyIdent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyIdent {
    Unique(u64),
    Process(libc::pid_t),
    Signal(libc::c_int),
    Object(usize),
    Path(PathBuf),
    Descriptor(RawFd),
}

impl EventKey {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// A kernel descriptor owned by exactly one [`Event`].
///
/// Closed once, on drop. A failing `close` cannot be reported to anyone at
/// that point, so it is logged.
#[derive(Debug)]
pub struct KernelHandle(RawFd);

impl KernelHandle {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl From<OwnedFd> for KernelHandle {
    fn from(fd: OwnedFd) -> Self {
        Self(fd.into_raw_fd())
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        if unsafe { libc::close(self.0) } < 0 {
            let error = std::io::Error::last_os_error();
            tracing::warn!(fd = self.0, %error, "failed to close event kernel handle");
        }
    }
}

/// Descriptor of a condition to wait for.
pub struct Event {
    id: u64,
    kind: EventKind,
    resource: EventResource,
    handle: Option<KernelHandle>,
}

impl Event {
    fn build(kind: EventKind, resource: EventResource, handle: Option<KernelHandle>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            resource,
            handle,
        })
    }

    /// A timer firing after `nanoseconds`; repeating at that period when
    /// dispatched as cyclic.
    pub fn for_duration(nanoseconds: u64) -> Result<Arc<Self>> {
        let handle = sys::timer_handle().map_err(|e| Error::kernel("timer", e))?;

        Ok(Self::build(
            EventKind::Time,
            EventResource::Duration(nanoseconds),
            handle,
        ))
    }

    /// Exit of process `pid`. Uses `kport` when given, otherwise allocates a
    /// process handle where the platform has one.
    pub fn for_process_exit(pid: libc::pid_t, kport: Option<OwnedFd>) -> Result<Arc<Self>> {
        let handle = match kport {
            Some(fd) => Some(KernelHandle::from(fd)),
            None => sys::process_handle(pid).map_err(|e| Error::kernel("process watch", e))?,
        };

        Ok(Self::build(
            EventKind::ProcessExit,
            EventResource::Process { pid },
            handle,
        ))
    }

    /// Delivery of signal `signo` to this process.
    pub fn for_signal(signo: libc::c_int, kport: Option<OwnedFd>) -> Result<Arc<Self>> {
        let handle = match kport {
            Some(fd) => Some(KernelHandle::from(fd)),
            None => sys::signal_handle(signo).map_err(|e| Error::kernel("signal watch", e))?,
        };

        Ok(Self::build(
            EventKind::ProcessSignal,
            EventResource::Signal { signo },
            handle,
        ))
    }

    /// An application marker keyed on `object`'s identity.
    ///
    /// `MetaActuate` markers fire immediately, exactly once, when dispatched.
    /// `MetaTerminate` markers fire when the scheduler closes. `Never`
    /// markers do not fire. `MetaException` markers install the exception
    /// trap and are never registered with the kernel.
    pub fn for_reference(
        kind: EventKind,
        object: Arc<dyn Any + Send + Sync>,
        kport: Option<OwnedFd>,
    ) -> Result<Arc<Self>> {
        if !kind.is_meta() {
            return Err(Error::InvalidKind {
                kind,
                constructor: "for_reference",
            });
        }

        let handle = match kport {
            Some(fd) => Some(KernelHandle::from(fd)),
            None if kind == EventKind::MetaException => None,
            None => sys::reference_handle(kind).map_err(|e| Error::kernel("reference", e))?,
        };

        Ok(Self::build(kind, EventResource::Reference(object), handle))
    }

    /// A change to the file at `path`. Opens the path for event monitoring
    /// unless `fileno` is supplied.
    pub fn for_path(
        kind: EventKind,
        path: impl AsRef<Path>,
        fileno: Option<OwnedFd>,
    ) -> Result<Arc<Self>> {
        if !kind.is_fs() {
            return Err(Error::InvalidKind {
                kind,
                constructor: "for_path",
            });
        }

        let path = path.as_ref();
        let handle = match fileno {
            Some(fd) => KernelHandle::from(fd),
            None => sys::path_handle(kind, path).map_err(|e| Error::kernel("path watch", e))?,
        };

        Ok(Self::build(
            kind,
            EventResource::Path(path.to_path_buf()),
            Some(handle),
        ))
    }

    /// Readiness of an I/O descriptor owned by the caller. `correlation` is
    /// the other half of a pair, e.g. the write side when watching reads.
    pub fn for_io(kind: EventKind, port: RawFd, correlation: Option<RawFd>) -> Result<Arc<Self>> {
        if !kind.is_io() {
            return Err(Error::InvalidKind {
                kind,
                constructor: "for_io",
            });
        }

        Ok(Self::build(
            kind,
            EventResource::Io { port, correlation },
            None,
        ))
    }

    /// What this event waits for.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The value the event was built from: a duration, process, signal,
    /// referenced object, path or I/O pair.
    pub fn resource(&self) -> &EventResource {
        &self.resource
    }

    /// Process-unique identifier, used as the kqueue ident for timers and
    /// markers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The descriptor this event owns and closes on drop, if any.
    ///
    /// # Returns
    /// `Some` for epoll timers, process exits, signals and path watches, and
    /// for kqueue path watches. `None` for I/O events, whose descriptor
    /// belongs to the caller.
    pub fn kernel_handle(&self) -> Option<RawFd> {
        self.handle.as_ref().map(KernelHandle::as_raw_fd)
    }

    pub fn resource_kind(&self) -> ResourceKind {
        if self.handle.is_some() {
            return ResourceKind::KernelHandle;
        }

        match self.resource {
            EventResource::None => ResourceKind::None,
            EventResource::Reference(_) | EventResource::Io { .. } => ResourceKind::ObjectPair,
            EventResource::Duration(_)
            | EventResource::Process { .. }
            | EventResource::Signal { .. }
            | EventResource::Path(_) => ResourceKind::RawIdentifier,
        }
    }

    /// Timer period, for `time` events.
    pub fn duration(&self) -> Option<u64> {
        match self.resource {
            EventResource::Duration(ns) => Some(ns),
            _ => None,
        }
    }

    /// The descriptor the kernel watches for this event: the owned handle if
    /// there is one, else the I/O port.
    pub fn watched_fd(&self) -> Option<RawFd> {
        match (&self.handle, &self.resource) {
            (Some(handle), _) => Some(handle.as_raw_fd()),
            (None, EventResource::Io { port, .. }) => Some(*port),
            _ => None,
        }
    }

    pub fn key(&self) -> EventKey {
        let ident = match &self.resource {
            _ if self.kind == EventKind::Time => KeyIdent::Unique(self.id),
            EventResource::Process { pid } => KeyIdent::Process(*pid),
            EventResource::Signal { signo } => KeyIdent::Signal(*signo),
            EventResource::Reference(object) => {
                KeyIdent::Object(Arc::as_ptr(object).cast::<()>() as usize)
            }
            EventResource::Path(path) => KeyIdent::Path(path.clone()),
            EventResource::Io { port, .. } => KeyIdent::Descriptor(*port),
            EventResource::Duration(_) | EventResource::None => KeyIdent::Unique(self.id),
        };

        EventKey {
            kind: self.kind,
            ident,
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("resource", &self.resource)
            .field("handle", &self.kernel_handle())
            .finish()
    }
}

/// Anything that resolves to the event it is scheduled on.
pub trait AsEvent {
    fn as_event(&self) -> &Event;
}

impl AsEvent for Event {
    fn as_event(&self) -> &Event {
        self
    }
}

impl<T: AsEvent + ?Sized> AsEvent for Arc<T> {
    fn as_event(&self) -> &Event {
        (**self).as_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_only_equal_themselves() {
        let a = Event::for_duration(1_000).unwrap();
        let b = Event::for_duration(1_000).unwrap();

        assert_eq!(*a, *a);
        assert_ne!(*a, *b);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_references_compare_by_object_and_kind() {
        let object: Arc<dyn Any + Send + Sync> = Arc::new(5u32);
        let other: Arc<dyn Any + Send + Sync> = Arc::new(5u32);

        let a = Event::for_reference(EventKind::MetaTerminate, object.clone(), None).unwrap();
        let b = Event::for_reference(EventKind::MetaTerminate, object.clone(), None).unwrap();
        let c = Event::for_reference(EventKind::MetaTerminate, other, None).unwrap();
        let d = Event::for_reference(EventKind::Never, object, None).unwrap();

        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_ne!(*a, *d);
    }

    #[test]
    fn test_io_events_compare_by_port() {
        let a = Event::for_io(EventKind::IoReceive, 7, None).unwrap();
        let b = Event::for_io(EventKind::IoReceive, 7, Some(8)).unwrap();
        let c = Event::for_io(EventKind::IoTransmit, 7, None).unwrap();

        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_eq!(a.watched_fd(), Some(7));
        assert_eq!(a.kernel_handle(), None);
        assert_eq!(a.resource_kind(), ResourceKind::ObjectPair);
    }

    #[test]
    fn test_constructors_reject_foreign_kinds() {
        let object: Arc<dyn Any + Send + Sync> = Arc::new(());

        assert!(matches!(
            Event::for_reference(EventKind::Time, object, None),
            Err(Error::InvalidKind { kind: EventKind::Time, .. })
        ));
        assert!(matches!(
            Event::for_io(EventKind::FsDelta, 0, None),
            Err(Error::InvalidKind { .. })
        ));
        assert!(matches!(
            Event::for_path(EventKind::IoReceive, "/", None),
            Err(Error::InvalidKind { .. })
        ));
    }

    #[test]
    fn test_exception_marker_has_no_handle() {
        let object: Arc<dyn Any + Send + Sync> = Arc::new(());
        let event = Event::for_reference(EventKind::MetaException, object, None).unwrap();

        assert_eq!(event.kernel_handle(), None);
    }

    #[test]
    fn test_kind_defaults() {
        assert!(!EventKind::Time.cyclic_by_default());
        assert!(!EventKind::ProcessExit.can_repeat());
        assert!(EventKind::ProcessSignal.cyclic_by_default());
        assert!(EventKind::IoTransmit.cyclic_by_default());
        assert!(EventKind::FsStatus.cyclic_by_default());
        assert_eq!(EventKind::FsVoid.to_string(), "fs_void");
    }
}
