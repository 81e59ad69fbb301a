#![allow(dead_code)]

use kernelq::{Config, Scheduler};
use std::sync::Once;

static LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness. `RUST_LOG` filters it.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A scheduler on the default backend that ignores the environment.
pub fn scheduler() -> Scheduler {
    init_test_logging();
    Scheduler::with_config(Config::default()).unwrap()
}

/// Waits and executes until `done` holds or `rounds` cycles have passed.
pub fn run_until(scheduler: &Scheduler, rounds: usize, done: impl Fn() -> bool) -> bool {
    for _ in 0..rounds {
        if done() {
            return true;
        }
        scheduler.wait(-10).unwrap();
        scheduler.execute().unwrap();
    }

    done()
}

/// A non-blocking pipe as (read, write).
pub fn pipe() -> (libc::c_int, libc::c_int) {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe failed");

    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    (fds[0], fds[1])
}

pub fn close(fd: libc::c_int) {
    unsafe {
        libc::close(fd);
    }
}
