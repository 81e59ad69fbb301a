mod common;

use common::{run_until, scheduler};
use kernelq::{Cyclic, Event, Link, signal_name};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_raised_signal_is_delivered() {
    let scheduler = scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let observer = count.clone();

    let event = Event::for_signal(libc::SIGUSR2, None).unwrap();
    let link = scheduler
        .dispatch(
            Link::new(event.clone(), move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Cyclic::Inherit,
        )
        .unwrap();
    assert!(link.is_cyclic());
    assert_eq!(signal_name(libc::SIGUSR2), Some("user.2"));

    unsafe { libc::raise(libc::SIGUSR2) };
    assert!(run_until(&scheduler, 100, || count.load(Ordering::SeqCst) == 1));

    unsafe { libc::raise(libc::SIGUSR2) };
    assert!(run_until(&scheduler, 100, || count.load(Ordering::SeqCst) == 2));

    scheduler.cancel(&event).unwrap();
    scheduler.close().unwrap();
}
