mod common;

use common::{run_until, scheduler};
use kernelq::{Cyclic, Event, EventKind, Link};

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_file_modification_is_reported() {
    let scheduler = scheduler();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    std::fs::write(&path, b"start\n").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let observer = count.clone();
    let event = Event::for_path(EventKind::FsDelta, &path, None).unwrap();
    scheduler
        .dispatch(
            Link::new(event.clone(), move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Cyclic::Inherit,
        )
        .unwrap();

    scheduler.wait(-10).unwrap();
    scheduler.execute().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"more\n").unwrap();
    file.sync_all().unwrap();

    assert!(run_until(&scheduler, 100, || count.load(Ordering::SeqCst) >= 1));
    assert!(scheduler.is_scheduled(&event));

    scheduler.cancel(&event).unwrap();
    scheduler.close().unwrap();
}

#[test]
fn test_file_removal_is_reported() {
    let scheduler = scheduler();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doomed");
    std::fs::write(&path, b"bye").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let observer = count.clone();
    let event = Event::for_path(EventKind::FsVoid, &path, None).unwrap();
    scheduler
        .dispatch(
            Link::new(event, move |_| {
                observer.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Cyclic::Never,
        )
        .unwrap();

    std::fs::remove_file(&path).unwrap();

    assert!(run_until(&scheduler, 100, || count.load(Ordering::SeqCst) == 1));
    assert_eq!(scheduler.kernel().scheduled(), 0);
    scheduler.close().unwrap();
}

#[test]
fn test_path_constructor_rejects_other_kinds() {
    common::init_test_logging();
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        Event::for_path(EventKind::IoReceive, dir.path(), None),
        Err(kernelq::Error::InvalidKind { .. })
    ));
}
