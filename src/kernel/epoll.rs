//! Linux `epoll` backend.
//!
//! Every event is watched through a descriptor: a `timerfd` for timers, a
//! `pidfd` for process exits, a `signalfd` for signals, an `eventfd` for
//! application markers, an inotify descriptor for filesystem changes, and the
//! caller's own descriptor for I/O readiness.
//!
//! epoll refuses to register the same descriptor twice in one instance, so
//! write-readiness registrations go into a secondary epoll instance that is
//! itself registered for read-readiness in the root instance. When the
//! secondary instance reports ready, [`Epoll::wait`] drains it into the rest
//! of the record buffer.

use super::{Backend, Delivery};
use crate::error::{Error, Result};
use crate::event::{EventKind, KernelHandle};
use crate::link::Link;

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    EPOLLET, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP, c_int, epoll_event,
};
use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Back-reference of the interrupt `eventfd`.
const INTERRUPT_TOKEN: u64 = 0;

/// Back-reference of the secondary write-readiness instance.
const TRANSMIT_TOKEN: u64 = 1;

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn cvt(result: c_int) -> io::Result<c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

fn owned(result: c_int) -> io::Result<OwnedFd> {
    cvt(result).map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ctl(epoll: RawFd, op: c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
    let mut event = epoll_event { events, u64: token };
    cvt(unsafe { libc::epoll_ctl(epoll, op, fd, &mut event) }).map(drop)
}

/// Reads whatever is pending on a non-blocking descriptor.
fn drain(fd: RawFd) {
    let mut buf = [0u8; 4096];

    loop {
        let read = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if read < buf.len() as isize {
            break;
        }
    }
}

fn timespec(nanoseconds: u64) -> libc::timespec {
    let mut spec: libc::timespec = unsafe { mem::zeroed() };
    spec.tv_sec = (nanoseconds / NANOS_PER_SEC) as libc::time_t;
    spec.tv_nsec = (nanoseconds % NANOS_PER_SEC) as _;
    spec
}

/// Arms a `timerfd`. Zero would disarm it, so the shortest interval is 1ns.
fn arm_timer(fd: RawFd, nanoseconds: u64, cyclic: bool) -> io::Result<()> {
    let period = timespec(nanoseconds.max(1));
    let value = libc::itimerspec {
        it_interval: if cyclic { period } else { timespec(0) },
        it_value: period,
    };

    cvt(unsafe { libc::timerfd_settime(fd, 0, &value, ptr::null_mut()) }).map(drop)
}

fn disarm_timer(fd: RawFd) -> io::Result<()> {
    let value = libc::itimerspec {
        it_interval: timespec(0),
        it_value: timespec(0),
    };

    cvt(unsafe { libc::timerfd_settime(fd, 0, &value, ptr::null_mut()) }).map(drop)
}

fn timeout_ms(timeout: Option<Duration>) -> c_int {
    match timeout {
        None => -1,
        Some(timeout) => timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(c_int::MAX as u128) as c_int,
    }
}

pub(crate) fn timer_handle() -> io::Result<Option<KernelHandle>> {
    let fd = owned(unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    })?;

    Ok(Some(fd.into()))
}

pub(crate) fn process_handle(pid: libc::pid_t) -> io::Result<Option<KernelHandle>> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };

    if fd < 0 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ENOSYS) {
            tracing::debug!(pid, "pidfd_open unavailable, process exit is unwatchable");
            return Ok(None);
        }
        return Err(error);
    }

    Ok(Some(KernelHandle::new(fd as RawFd)))
}

/// Blocks `signo` for the calling thread and opens a `signalfd` for it.
pub(crate) fn signal_handle(signo: c_int) -> io::Result<Option<KernelHandle>> {
    let mut mask = MaybeUninit::<libc::sigset_t>::uninit();

    let mask = unsafe {
        cvt(libc::sigemptyset(mask.as_mut_ptr()))?;
        cvt(libc::sigaddset(mask.as_mut_ptr(), signo))?;
        mask.assume_init()
    };

    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    let fd = owned(unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) })?;

    Ok(Some(fd.into()))
}

/// `eventfd` backing an application marker; actuation markers start signalled.
pub(crate) fn reference_handle(kind: EventKind) -> io::Result<Option<KernelHandle>> {
    let initial = u32::from(kind == EventKind::MetaActuate);
    let fd = owned(unsafe { libc::eventfd(initial, EFD_NONBLOCK | EFD_CLOEXEC) })?;

    Ok(Some(fd.into()))
}

fn inotify_mask(kind: EventKind) -> u32 {
    let void = libc::IN_DELETE_SELF | libc::IN_MOVE_SELF;
    let delta = libc::IN_MODIFY;

    match kind {
        EventKind::FsVoid => void,
        EventKind::FsDelta => delta,
        _ => void | delta | libc::IN_ATTRIB,
    }
}

pub(crate) fn path_handle(kind: EventKind, path: &Path) -> io::Result<KernelHandle> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let fd = owned(unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) })?;
    cvt(unsafe { libc::inotify_add_watch(fd.as_raw_fd(), path.as_ptr(), inotify_mask(kind)) })?;

    Ok(fd.into())
}

/// epoll instance plus its interrupt `eventfd` and write-readiness instance.
#[derive(Debug)]
pub struct Epoll {
    root: AtomicI32,
    transmit: AtomicI32,
    interrupt: AtomicI32,
}

impl Epoll {
    fn instance(&self, kind: EventKind) -> RawFd {
        match kind {
            EventKind::IoTransmit => self.transmit.load(Ordering::Acquire),
            _ => self.root.load(Ordering::Acquire),
        }
    }

    fn interest(kind: EventKind, cyclic: bool) -> u32 {
        let mut events = match kind {
            EventKind::IoTransmit => (EPOLLOUT | EPOLLET) as u32,
            EventKind::IoStatus => (EPOLLRDHUP | EPOLLPRI) as u32,
            _ => EPOLLIN as u32,
        };

        if !cyclic {
            events |= EPOLLONESHOT as u32;
        }

        events
    }

    fn release(&self) -> io::Result<()> {
        let mut result = Ok(());

        for slot in [&self.root, &self.transmit, &self.interrupt] {
            let fd = slot.swap(-1, Ordering::AcqRel);
            if fd >= 0 && unsafe { libc::close(fd) } < 0 && result.is_ok() {
                result = Err(io::Error::last_os_error());
            }
        }

        result
    }
}

impl Backend for Epoll {
    type Record = epoll_event;

    const EMPTY: epoll_event = epoll_event { events: 0, u64: 0 };

    const NAME: &'static str = "epoll";

    fn open() -> io::Result<Self> {
        let root = owned(unsafe { libc::epoll_create1(EPOLL_CLOEXEC) })?;
        let transmit = owned(unsafe { libc::epoll_create1(EPOLL_CLOEXEC) })?;
        let interrupt = owned(unsafe { libc::eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) })?;

        ctl(root.as_raw_fd(), EPOLL_CTL_ADD, interrupt.as_raw_fd(), EPOLLIN as u32, INTERRUPT_TOKEN)?;
        ctl(root.as_raw_fd(), EPOLL_CTL_ADD, transmit.as_raw_fd(), EPOLLIN as u32, TRANSMIT_TOKEN)?;

        Ok(Self {
            root: AtomicI32::new(root.into_raw_fd()),
            transmit: AtomicI32::new(transmit.into_raw_fd()),
            interrupt: AtomicI32::new(interrupt.into_raw_fd()),
        })
    }

    fn is_open(&self) -> bool {
        self.root.load(Ordering::Acquire) >= 0
    }

    fn register(&self, link: &Link, cyclic: bool, previous: Option<&Link>) -> Result<()> {
        let event = link.event();
        let kind = event.kind();
        let fd = event.watched_fd().ok_or(Error::Unsupported {
            kind,
            backend: Self::NAME,
        })?;

        let instance = self.instance(kind);
        if instance < 0 {
            return Err(Error::Closed);
        }

        if kind == EventKind::Time {
            arm_timer(fd, event.duration().unwrap_or(0), cyclic)
                .map_err(|e| Error::kernel("timer", e))?;
        }

        let events = Self::interest(kind, cyclic);
        let token = link as *const Link as u64;

        let reuse = previous.is_some_and(|previous| {
            previous.event().watched_fd() == Some(fd)
                && self.instance(previous.event().kind()) == instance
        });

        let registered = if reuse {
            match ctl(instance, EPOLL_CTL_MOD, fd, events, token) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    ctl(instance, EPOLL_CTL_ADD, fd, events, token)
                }
                other => other,
            }
        } else {
            ctl(instance, EPOLL_CTL_ADD, fd, events, token)
        };
        registered.map_err(|e| Error::kernel("schedule", e))?;

        if let Some(previous) = previous.filter(|_| !reuse)
            && let Err(error) = self.deregister(previous)
        {
            tracing::debug!(%error, "replaced registration was already gone");
        }

        Ok(())
    }

    fn deregister(&self, link: &Link) -> io::Result<()> {
        let event = link.event();
        let kind = event.kind();

        let Some(fd) = event.watched_fd() else {
            return Ok(());
        };

        if kind == EventKind::Time {
            disarm_timer(fd)?;
        }

        let instance = self.instance(kind);
        if instance < 0 {
            return Ok(());
        }

        match ctl(instance, EPOLL_CTL_DEL, fd, 0, 0) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            other => other,
        }
    }

    fn interrupt(&self) -> io::Result<()> {
        let fd = self.interrupt.load(Ordering::Acquire);
        let value: u64 = 1;

        let written = unsafe {
            libc::write(
                fd,
                (&value as *const u64).cast(),
                mem::size_of::<u64>(),
            )
        };

        if written < 0 {
            let error = io::Error::last_os_error();
            // A saturated counter still wakes the waiter.
            if error.kind() != io::ErrorKind::WouldBlock {
                return Err(error);
            }
        }

        Ok(())
    }

    fn wait(&self, records: &mut [epoll_event], timeout: Option<Duration>) -> io::Result<usize> {
        let root = self.root.load(Ordering::Acquire);
        if root < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let capacity = records.len().min(c_int::MAX as usize);
        let received = cvt(unsafe {
            libc::epoll_wait(root, records.as_mut_ptr(), capacity as c_int, timeout_ms(timeout))
        })? as usize;

        let mut count = received;
        let multiplexed = records[..received]
            .iter()
            .any(|record| {
                let token = record.u64;
                token == TRANSMIT_TOKEN
            });

        if multiplexed && count < capacity {
            let transmit = self.transmit.load(Ordering::Acquire);
            let extra = unsafe {
                libc::epoll_wait(
                    transmit,
                    records[count..].as_mut_ptr(),
                    (capacity - count) as c_int,
                    0,
                )
            };

            if extra > 0 {
                count += extra as usize;
            }
        }

        Ok(count)
    }

    fn delivery(&self, record: &epoll_event) -> Delivery {
        let token = record.u64;

        match token {
            INTERRUPT_TOKEN => Delivery::Interrupt,
            TRANSMIT_TOKEN => Delivery::Ignored,
            token => Delivery::Link {
                link: token as *const Link,
                armed: true,
            },
        }
    }

    fn acknowledge(&self, _record: &epoll_event, link: &Link) {
        let event = link.event();

        let Some(fd) = event.kernel_handle() else {
            return;
        };

        match event.kind() {
            EventKind::ProcessExit => {}
            kind if kind.is_io() => {}
            _ => drain(fd),
        }
    }

    fn acknowledge_interrupt(&self) {
        let fd = self.interrupt.load(Ordering::Acquire);
        if fd >= 0 {
            drain(fd);
        }
    }

    fn close(&self) -> io::Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }

        self.release().map(|()| true)
    }

    fn forget(&self) {
        self.root.store(-1, Ordering::Release);

        if let Err(error) = self.release() {
            tracing::warn!(%error, "failed to release epoll auxiliary handles");
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!(%error, "failed to close epoll handles");
        }
    }
}
