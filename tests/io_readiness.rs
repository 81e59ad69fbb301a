mod common;

use common::{run_until, scheduler};
use kernelq::{Cyclic, Event, EventKind, Link};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn counter(count: &Arc<AtomicUsize>) -> impl Fn(&Link) -> kernelq::TaskResult + Send + Sync + 'static {
    let count = count.clone();
    move |_: &Link| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_pipe_receive_fires_when_readable() {
    let scheduler = scheduler();
    let (read, write) = common::pipe();
    let count = Arc::new(AtomicUsize::new(0));

    let event = Event::for_io(EventKind::IoReceive, read, Some(write)).unwrap();
    let link = scheduler
        .dispatch(Link::new(event.clone(), counter(&count)), Cyclic::Inherit)
        .unwrap();
    assert!(link.is_cyclic());

    scheduler.wait(-10).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let wrote = unsafe { libc::write(write, b"x".as_ptr().cast(), 1) };
    assert_eq!(wrote, 1);

    assert!(run_until(&scheduler, 100, || count.load(Ordering::SeqCst) >= 1));

    let mut buf = [0u8; 1];
    let read_bytes = unsafe { libc::read(read, buf.as_mut_ptr().cast(), 1) };
    assert_eq!(read_bytes, 1);

    let settled = count.load(Ordering::SeqCst);
    scheduler.wait(-10).unwrap();
    scheduler.execute().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), settled);
    assert!(scheduler.is_scheduled(&event));

    scheduler.cancel(&event).unwrap();
    scheduler.close().unwrap();
    common::close(read);
    common::close(write);
}

#[test]
fn test_socket_receive_and_transmit_on_one_descriptor() {
    let scheduler = scheduler();
    let mut fds = [0; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (local, remote) = (fds[0], fds[1]);

    let received = Arc::new(AtomicUsize::new(0));
    let transmitted = Arc::new(AtomicUsize::new(0));

    let receive = Event::for_io(EventKind::IoReceive, local, None).unwrap();
    let transmit = Event::for_io(EventKind::IoTransmit, local, None).unwrap();
    scheduler
        .dispatch(Link::new(receive.clone(), counter(&received)), Cyclic::Inherit)
        .unwrap();
    scheduler
        .dispatch(Link::new(transmit.clone(), counter(&transmitted)), Cyclic::Inherit)
        .unwrap();

    // A fresh socket is writable straight away.
    assert!(run_until(&scheduler, 100, || transmitted.load(Ordering::SeqCst) >= 1));
    assert_eq!(received.load(Ordering::SeqCst), 0);

    let wrote = unsafe { libc::write(remote, b"ping".as_ptr().cast(), 4) };
    assert_eq!(wrote, 4);

    assert!(run_until(&scheduler, 100, || received.load(Ordering::SeqCst) >= 1));

    scheduler.cancel(&receive).unwrap();
    scheduler.cancel(&transmit).unwrap();
    assert_eq!(scheduler.kernel().scheduled(), 0);

    scheduler.close().unwrap();
    common::close(local);
    common::close(remote);
}
