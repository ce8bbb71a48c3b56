//! Worker process lifecycle.
//!
//! Workers are literal `fork()`s of the running proxy image — no `exec` —
//! each handling exactly one device scan before
//! exiting. `PR_SET_PDEATHSIG` is installed in the child immediately after
//! fork so an abrupt proxy death doesn't orphan it, and the child re-checks
//! `getppid()` against the pid captured before fork to close the race where
//! the parent died before the signal was armed.

use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid};

use crate::error::WorkerError;
use crate::worker::channel::WorkerChannel;

/// Where a worker is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycle {
    New,
    Idle,
    Assigned,
    Exiting,
    TimedOut,
    Exited,
}

/// The proxy-side handle to a forked worker.
pub struct WorkerHandle {
    pub pid: Pid,
    pub channel: WorkerChannel,
    pub state: WorkerLifecycle,
    assigned_at: Option<Instant>,
}

impl WorkerHandle {
    pub fn assign(&mut self) {
        self.state = WorkerLifecycle::Assigned;
        self.assigned_at = Some(Instant::now());
    }

    pub fn mark_idle(&mut self) {
        self.state = WorkerLifecycle::Idle;
        self.assigned_at = None;
    }

    /// Whether this worker has exceeded its execution timeout, and if
    /// so transitions it into `TimedOut`.
    pub fn check_timeout(&mut self, limit: Duration) -> bool {
        if self.state != WorkerLifecycle::Assigned {
            return false;
        }
        let Some(started) = self.assigned_at else { return false };
        if started.elapsed() > limit {
            self.state = WorkerLifecycle::TimedOut;
            true
        } else {
            false
        }
    }
}

/// Fork a worker process. The child runs `child_main` to completion (which
/// should perform exactly one device scan, report its result over the given
/// raw channel fd, and return its exit code) and then calls `_exit` directly
/// — never returning into the caller's normal control flow, matching the
/// no-`exec` worker model. The parent gets back a [`WorkerHandle`] over one
/// end of a connected `UnixStream` socketpair (chosen over a bare `pipe(2)`
/// because ancillary-FD transfer needs `SCM_RIGHTS`, which only a `AF_UNIX`
/// socket supports).
///
/// `child_main` receives its end of the channel as a bare [`RawFd`] rather
/// than a [`WorkerChannel`]: the child inherits no Tokio reactor across
/// `fork()`, so it cannot construct a [`tokio::net::UnixStream`] of
/// its own — it drives the fd directly via
/// [`crate::worker::channel::send_with_fd_raw`]/`recv_with_fd_raw`, or plain
/// `write`/`read`.
pub fn spawn_worker(child_main: impl FnOnce(std::os::fd::RawFd) -> i32) -> Result<WorkerHandle, WorkerError> {
    let (parent_sock, child_sock) =
        tokio::net::UnixStream::pair().map_err(WorkerError::Channel)?;

    let captured_ppid = nix::unistd::getpid();

    // SAFETY: the child performs only async-signal-safe setup (prctl, close,
    // exit) before running `child_main`; it never returns past this call.
    match unsafe { nix::unistd::fork() }.map_err(WorkerError::Fork)? {
        ForkResult::Parent { child } => {
            drop(child_sock);
            Ok(WorkerHandle {
                pid: child,
                channel: WorkerChannel::new(parent_sock),
                state: WorkerLifecycle::New,
                assigned_at: None,
            })
        }
        ForkResult::Child => {
            drop(parent_sock);
            // Scan workers are internal workers; SIGUSR1 is their
            // death-of-parent signal (external workers would get SIGTERM).
            install_pdeathsig(Signal::SIGUSR1);
            check_parent_or_exit(captured_ppid);
            let raw_fd = child_sock.as_raw_fd();
            let code = child_main(raw_fd);
            std::process::exit(code);
        }
    }
}

fn install_pdeathsig(sig: Signal) {
    // Best-effort: if the parent is already gone by the time this runs,
    // `sig` arrives immediately, which `check_parent_or_exit` below also
    // catches via the ppid race window.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, sig as libc::c_ulong);
    }
}

/// Closes the race between fork and `install_pdeathsig`: if the parent
/// already exited in that window, no signal is ever delivered because
/// `PR_SET_PDEATHSIG` wasn't installed yet. Re-checking `getppid()` against
/// the pid captured before fork catches that case (a dead parent is
/// reparented, so `getppid()` no longer matches).
fn check_parent_or_exit(captured_ppid: Pid) {
    if nix::unistd::getppid() != captured_ppid {
        std::process::exit(1);
    }
}
