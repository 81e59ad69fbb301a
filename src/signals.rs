//! Symbolic signal names for diagnostics.

use libc::c_int;

const NAMES: &[(c_int, &str)] = &[
    (libc::SIGHUP, "terminal.hangup"),
    (libc::SIGINT, "terminal.interrupt"),
    (libc::SIGQUIT, "terminal.quit"),
    (libc::SIGTERM, "process.terminate"),
    (libc::SIGCONT, "process.continue"),
    (libc::SIGTSTP, "terminal.stop"),
    (libc::SIGWINCH, "terminal.delta"),
    (libc::SIGUSR1, "user.1"),
    (libc::SIGUSR2, "user.2"),
    (libc::SIGPIPE, "io.broken"),
    (libc::SIGURG, "io.urgent"),
    (libc::SIGIO, "io.ready"),
    (libc::SIGCHLD, "process.child"),
    (libc::SIGALRM, "time.alarm"),
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    (libc::SIGINFO, "terminal.query"),
];

/// Signals a kqueue is subscribed to when it opens.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) const DEFAULT_SIGNALS: &[c_int] = &[
    libc::SIGCONT,
    libc::SIGHUP,
    libc::SIGINFO,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGTERM,
    libc::SIGTSTP,
    libc::SIGWINCH,
    libc::SIGPIPE,
    libc::SIGURG,
    libc::SIGIO,
];

/// The diagnostic name of `signo`, if it is one the scheduler knows about.
pub fn signal_name(signo: c_int) -> Option<&'static str> {
    NAMES
        .iter()
        .find(|(code, _)| *code == signo)
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_signals() {
        assert_eq!(signal_name(libc::SIGTERM), Some("process.terminate"));
        assert_eq!(signal_name(libc::SIGUSR1), Some("user.1"));
        assert_eq!(signal_name(libc::SIGIO), Some("io.ready"));
    }

    #[test]
    fn test_unknown_signal() {
        assert_eq!(signal_name(0), None);
    }
}
