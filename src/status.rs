//! Run status and termination requests.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Outcome of a role's run loop. Anything but `Ok` stops the loop at its
/// next check point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    ConnectRetriesExceeded,
    RuntimeExceeded,
    Terminated,
}

impl RunStatus {
    /// Whether the process should exit with a zero code.
    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Ok | RunStatus::RuntimeExceeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Ok => "OK",
            RunStatus::ConnectRetriesExceeded => "connection retries exceeded",
            RunStatus::RuntimeExceeded => "run-time exceeded",
            RunStatus::Terminated => "run-time terminated",
        })
    }
}

/// Signal number of the last termination signal, or 0.
static SIGNALED: AtomicI32 = AtomicI32::new(0);

extern "C" fn signal_handler(signo: libc::c_int) {
    SIGNALED.store(signo, Ordering::Relaxed);
}

/// Route SIGINT and SIGTERM to [`TerminateFlag`] observers.
pub fn install_signal_handler() -> std::io::Result<()> {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        let prev = unsafe { libc::signal(signo, signal_handler as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Cooperative termination request checked by the run loops.
///
/// Set explicitly with [`TerminateFlag::request`] or by a termination signal
/// once [`install_signal_handler`] has run.
#[derive(Debug, Clone, Default)]
pub struct TerminateFlag(Arc<AtomicBool>);

impl TerminateFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        if self.0.load(Ordering::Relaxed) {
            return true;
        }

        let signo = SIGNALED.load(Ordering::Relaxed);
        if signo != 0 {
            info!(signal = signo, "run-time signal handling");
            self.request();
            return true;
        }
        false
    }
}

/// Log an unrecoverable condition and abort the process.
pub fn fatal(msg: impl fmt::Display) -> ! {
    error!("{}", msg);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert!(RunStatus::Ok.is_success());
        assert!(RunStatus::RuntimeExceeded.is_success());
        assert!(!RunStatus::ConnectRetriesExceeded.is_success());
        assert!(!RunStatus::Terminated.is_success());
    }

    #[test]
    fn test_terminate_flag_is_shared() {
        let flag = TerminateFlag::new();
        let other = flag.clone();
        assert!(!other.is_requested());

        flag.request();
        assert!(other.is_requested());
    }
}
