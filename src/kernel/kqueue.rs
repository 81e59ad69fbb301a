//! BSD `kqueue` backend (macOS, iOS, FreeBSD).
//!
//! Timers and application markers are keyed on the event's id, so they need
//! no descriptor. The interrupt is the `EVFILT_USER` registration with ident
//! 0; event ids start at 1 and never collide with it.
//!
//! A default set of signals is subscribed at open with no back-reference so
//! that deliveries nobody asked for can still be logged.

use super::{Backend, Delivery, TimerUnit};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventResource, KernelHandle};
use crate::link::Link;
use crate::signals::DEFAULT_SIGNALS;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ERROR, EV_ONESHOT, EV_RECEIPT, EVFILT_PROC, EVFILT_READ,
    EVFILT_SIGNAL, EVFILT_TIMER, EVFILT_USER, EVFILT_VNODE, EVFILT_WRITE, NOTE_ATTRIB,
    NOTE_DELETE, NOTE_EXIT, NOTE_EXTEND, NOTE_RENAME, NOTE_TRIGGER, NOTE_WRITE, c_int, kevent,
};
use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// `EVFILT_USER` ident of the interrupt.
const INTERRUPT_IDENT: usize = 0;

/// Finest timer unit the platform accepts, with its `fflags` note. Without a
/// unit note `EVFILT_TIMER` counts milliseconds.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const TIMER_UNIT: (TimerUnit, u32) = (TimerUnit::Nanoseconds, libc::NOTE_NSECONDS);
#[cfg(target_os = "netbsd")]
const TIMER_UNIT: (TimerUnit, u32) = (TimerUnit::Microseconds, libc::NOTE_USECONDS);
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd"
)))]
const TIMER_UNIT: (TimerUnit, u32) = (TimerUnit::Milliseconds, 0);

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A raw `kevent`. The back-reference pointer inside is only ever
/// dereferenced by the kernel queue, under its registry lock.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Record(kevent);

// SAFETY: see `Record`; the `udata` pointer is an opaque token here.
unsafe impl Send for Record {}

impl Record {
    pub fn filter(&self) -> i16 {
        self.0.filter as i16
    }

    pub fn ident(&self) -> usize {
        self.0.ident as usize
    }
}

fn cvt(result: c_int) -> io::Result<c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, data: i64, udata: *const Link) -> kevent {
    let mut change: kevent = unsafe { mem::zeroed() };
    change.ident = ident as _;
    change.filter = filter as _;
    change.flags = flags as _;
    change.fflags = fflags;
    change.data = data as _;
    change.udata = udata as *mut libc::c_void as _;
    change
}

fn vnode_mask(kind: EventKind) -> u32 {
    let void = NOTE_DELETE | NOTE_RENAME;
    let delta = NOTE_WRITE | NOTE_EXTEND;

    match kind {
        EventKind::FsVoid => void,
        EventKind::FsDelta => delta,
        _ => void | delta | NOTE_ATTRIB,
    }
}

fn timeout_spec(timeout: Duration) -> libc::timespec {
    let nanoseconds = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    let mut spec: libc::timespec = unsafe { mem::zeroed() };
    spec.tv_sec = (nanoseconds / NANOS_PER_SEC).min(libc::time_t::MAX as u64) as libc::time_t;
    spec.tv_nsec = (nanoseconds % NANOS_PER_SEC) as _;
    spec
}

fn is_default_signal(signo: c_int) -> bool {
    DEFAULT_SIGNALS.contains(&signo)
}

pub(crate) fn timer_handle() -> io::Result<Option<KernelHandle>> {
    Ok(None)
}

pub(crate) fn process_handle(_pid: libc::pid_t) -> io::Result<Option<KernelHandle>> {
    Ok(None)
}

/// Ignores `signo` if it still has its default disposition, so that its
/// delivery reaches `EVFILT_SIGNAL` instead of terminating the process.
pub(crate) fn signal_handle(signo: c_int) -> io::Result<Option<KernelHandle>> {
    let mut current = MaybeUninit::<libc::sigaction>::uninit();

    let current = unsafe {
        cvt(libc::sigaction(signo, ptr::null(), current.as_mut_ptr()))?;
        current.assume_init()
    };

    if current.sa_sigaction == libc::SIG_DFL {
        let mut ignore: libc::sigaction = unsafe { mem::zeroed() };
        ignore.sa_sigaction = libc::SIG_IGN;
        cvt(unsafe { libc::sigaction(signo, &ignore, ptr::null_mut()) })?;
    }

    Ok(None)
}

pub(crate) fn reference_handle(_kind: EventKind) -> io::Result<Option<KernelHandle>> {
    Ok(None)
}

pub(crate) fn path_handle(_kind: EventKind, path: &Path) -> io::Result<KernelHandle> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let flags = libc::O_EVTONLY | libc::O_CLOEXEC;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let flags = libc::O_RDONLY | libc::O_CLOEXEC;

    let fd = cvt(unsafe { libc::open(path.as_ptr(), flags) })?;

    Ok(KernelHandle::new(fd))
}

/// kqueue instance.
#[derive(Debug)]
pub struct Kqueue {
    root: AtomicI32,
}

impl Kqueue {
    /// Submits one change and reports its receipt.
    fn apply(&self, change: kevent) -> io::Result<()> {
        let root = self.root.load(Ordering::Acquire);
        if root < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let mut change = change;
        change.flags |= EV_RECEIPT as _;
        let mut receipt: kevent = unsafe { mem::zeroed() };

        let count = cvt(unsafe { libc::kevent(root, &change, 1, &mut receipt, 1, ptr::null()) })?;

        if count > 0 && (receipt.flags as u16) & (EV_ERROR as u16) != 0 && receipt.data != 0 {
            return Err(io::Error::from_raw_os_error(receipt.data as i32));
        }

        Ok(())
    }

    /// The `(ident, filter)` pair the kernel knows `event` by.
    fn target(event: &Event) -> Option<(usize, i16)> {
        let kind = event.kind();

        let target = match (kind, event.resource()) {
            (EventKind::Time, _) => (event.id() as usize, EVFILT_TIMER as i16),
            (EventKind::ProcessExit, EventResource::Process { pid }) => {
                (*pid as usize, EVFILT_PROC as i16)
            }
            (EventKind::ProcessSignal, EventResource::Signal { signo }) => {
                (*signo as usize, EVFILT_SIGNAL as i16)
            }
            (EventKind::IoTransmit, EventResource::Io { port, .. }) => {
                (*port as usize, EVFILT_WRITE as i16)
            }
            (EventKind::IoReceive | EventKind::IoStatus, EventResource::Io { port, .. }) => {
                (*port as usize, EVFILT_READ as i16)
            }
            (kind, _) if kind.is_fs() => (event.kernel_handle()? as usize, EVFILT_VNODE as i16),
            (kind, _) if kind.is_meta() => (event.id() as usize, EVFILT_USER as i16),
            _ => return None,
        };

        Some(target)
    }

    fn registration(event: &Event, ident: usize, filter: i16, cyclic: bool, link: &Link) -> kevent {
        let kind = event.kind();
        let mut flags = EV_ADD as u16;
        let mut fflags = 0;
        let mut data = 0;

        if !cyclic {
            flags |= EV_ONESHOT as u16;
        }

        match kind {
            EventKind::Time => {
                let (unit, note) = TIMER_UNIT;
                fflags = note;
                data = unit.convert(event.duration().unwrap_or(0)).max(1);
            }
            EventKind::ProcessExit => fflags = NOTE_EXIT,
            EventKind::IoTransmit => flags |= EV_CLEAR as u16,
            EventKind::MetaActuate => {
                flags |= EV_CLEAR as u16;
                fflags = NOTE_TRIGGER;
            }
            kind if kind.is_meta() => flags |= EV_CLEAR as u16,
            kind if kind.is_fs() => {
                flags |= EV_CLEAR as u16;
                fflags = vnode_mask(kind);
            }
            _ => {}
        }

        change(ident, filter, flags, fflags, data, link)
    }
}

impl Backend for Kqueue {
    type Record = Record;

    const EMPTY: Record = Record(unsafe { mem::zeroed() });

    const NAME: &'static str = "kqueue";

    fn open() -> io::Result<Self> {
        let root = cvt(unsafe { libc::kqueue() })?;
        unsafe { libc::fcntl(root, libc::F_SETFD, libc::FD_CLOEXEC) };

        let queue = Self {
            root: AtomicI32::new(root),
        };

        let interrupt = change(
            INTERRUPT_IDENT,
            EVFILT_USER as i16,
            (EV_ADD | EV_CLEAR) as u16,
            0,
            0,
            ptr::null(),
        );
        queue.apply(interrupt)?;

        for &signo in DEFAULT_SIGNALS {
            let subscription = change(
                signo as usize,
                EVFILT_SIGNAL as i16,
                EV_ADD as u16,
                0,
                0,
                ptr::null(),
            );

            if let Err(error) = queue.apply(subscription) {
                tracing::debug!(signo, %error, "default signal subscription failed");
            }
        }

        Ok(queue)
    }

    fn is_open(&self) -> bool {
        self.root.load(Ordering::Acquire) >= 0
    }

    fn register(&self, link: &Link, cyclic: bool, previous: Option<&Link>) -> Result<()> {
        let event = link.event();
        let kind = event.kind();
        let (ident, filter) = Self::target(event).ok_or(Error::Unsupported {
            kind,
            backend: Self::NAME,
        })?;

        if !self.is_open() {
            return Err(Error::Closed);
        }

        self.apply(Self::registration(event, ident, filter, cyclic, link))
            .map_err(|e| Error::kernel("schedule", e))?;

        // Same ident and filter means the kernel replaced it in place.
        if let Some(previous) = previous
            && Self::target(previous.event()) != Some((ident, filter))
            && let Err(error) = self.deregister(previous)
        {
            tracing::debug!(%error, "replaced registration was already gone");
        }

        Ok(())
    }

    fn deregister(&self, link: &Link) -> io::Result<()> {
        let event = link.event();

        let Some((ident, filter)) = Self::target(event) else {
            return Ok(());
        };

        let change = match event.resource() {
            EventResource::Signal { signo } if is_default_signal(*signo) => change(
                ident,
                filter,
                EV_ADD as u16,
                0,
                0,
                ptr::null(),
            ),
            _ => change(ident, filter, EV_DELETE as u16, 0, 0, ptr::null()),
        };

        match self.apply(change) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ESRCH)) => Ok(()),
            other => other,
        }
    }

    fn interrupt(&self) -> io::Result<()> {
        self.apply(change(
            INTERRUPT_IDENT,
            EVFILT_USER as i16,
            0,
            NOTE_TRIGGER,
            0,
            ptr::null(),
        ))
    }

    fn wait(&self, records: &mut [Record], timeout: Option<Duration>) -> io::Result<usize> {
        let root = self.root.load(Ordering::Acquire);
        if root < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let spec = timeout.map(timeout_spec);
        let spec = spec.as_ref().map_or(ptr::null(), |spec| spec as *const libc::timespec);
        let capacity = records.len().min(c_int::MAX as usize) as c_int;

        let count = cvt(unsafe {
            libc::kevent(
                root,
                ptr::null(),
                0,
                records.as_mut_ptr().cast::<kevent>(),
                capacity,
                spec,
            )
        })?;

        Ok(count as usize)
    }

    fn delivery(&self, record: &Record) -> Delivery {
        let event = &record.0;
        let filter = event.filter as i16;

        if (event.flags as u16) & (EV_ERROR as u16) != 0 {
            return Delivery::Ignored;
        }

        if event.udata.is_null() {
            return match filter {
                f if f == EVFILT_USER as i16 && event.ident as usize == INTERRUPT_IDENT => {
                    Delivery::Interrupt
                }
                f if f == EVFILT_SIGNAL as i16 => Delivery::Unclaimed(event.ident as c_int),
                _ => Delivery::Ignored,
            };
        }

        Delivery::Link {
            link: event.udata as *const Link,
            armed: false,
        }
    }

    fn acknowledge(&self, _record: &Record, _link: &Link) {}

    fn acknowledge_interrupt(&self) {}

    fn close(&self) -> io::Result<bool> {
        let root = self.root.swap(-1, Ordering::AcqRel);
        if root < 0 {
            return Ok(false);
        }

        cvt(unsafe { libc::close(root) })?;
        Ok(true)
    }

    fn forget(&self) {
        self.root.store(-1, Ordering::Release);
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::warn!(%error, "failed to close kqueue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vnode_masks() {
        assert_eq!(vnode_mask(EventKind::FsVoid), NOTE_DELETE | NOTE_RENAME);
        assert_eq!(vnode_mask(EventKind::FsDelta), NOTE_WRITE | NOTE_EXTEND);
        assert_ne!(vnode_mask(EventKind::FsStatus) & NOTE_ATTRIB, 0);
    }

    #[test]
    fn test_targets() {
        let timer = Event::for_duration(1).unwrap();
        assert_eq!(
            Kqueue::target(&timer),
            Some((timer.id() as usize, EVFILT_TIMER as i16))
        );

        let io = Event::for_io(EventKind::IoTransmit, 7, None).unwrap();
        assert_eq!(Kqueue::target(&io), Some((7, EVFILT_WRITE as i16)));
    }

    #[test]
    fn test_timer_unit_keeps_short_timers() {
        let (unit, note) = TIMER_UNIT;

        assert_eq!(unit, TimerUnit::Nanoseconds);
        assert_eq!(note, libc::NOTE_NSECONDS);
        assert_eq!(unit.convert(1), 1);
        assert_eq!(unit.convert(1_500_000), 1_500_000);
    }

    #[test]
    fn test_timeout_spec() {
        let spec = timeout_spec(Duration::from_millis(1500));
        assert_eq!(spec.tv_sec, 1);
        assert_eq!(spec.tv_nsec, 500_000_000);
    }

    #[test]
    fn test_open_close() {
        let queue = Kqueue::open().unwrap();

        assert!(queue.is_open());
        assert!(queue.close().unwrap());
        assert!(!queue.close().unwrap());
    }
}
