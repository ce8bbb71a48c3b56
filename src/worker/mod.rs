//! Worker control: spawning one-shot scan workers, framing their control
//! channel, and reaping them.

pub mod channel;
pub mod process;

pub use channel::{recv_with_fd_raw, send_with_fd_raw, ChannelSpec, ChannelTag, WorkerChannel};
pub use process::{spawn_worker, WorkerHandle, WorkerLifecycle};

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};

use crate::error::WorkerError;

/// The execution timeout past which an assigned worker is presumed wedged
/// and reaped.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks the live workers of one proxy process.
#[derive(Default)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(timeout: Duration) -> Self {
        Self { workers: Vec::new(), timeout }
    }

    /// Fork a new worker to run `child_main`, adding it to the pool.
    pub fn spawn(
        &mut self,
        child_main: impl FnOnce(std::os::fd::RawFd) -> i32,
    ) -> Result<&mut WorkerHandle, WorkerError> {
        let handle = spawn_worker(child_main)?;
        self.workers.push(handle);
        Ok(self.workers.last_mut().expect("just pushed"))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sweep for workers that have exceeded their execution timeout,
    /// marking them `TimedOut` and returning their pids so the caller can
    /// signal them.
    pub fn sweep_timeouts(&mut self) -> Vec<nix::unistd::Pid> {
        self.workers
            .iter_mut()
            .filter(|w| w.check_timeout(self.timeout))
            .map(|w| w.pid)
            .collect()
    }

    /// Drop handles for workers that have fully exited. The caller is
    /// expected to have already reaped their pid via `waitpid`/`SIGCHLD`.
    pub fn retain_live(&mut self) {
        self.workers.retain(|w| w.state != WorkerLifecycle::Exited);
    }

    /// Drop the handle for a specific worker, e.g. once a one-shot scan
    /// worker's synchronous `waitpid` has already reaped its pid directly
    /// (as opposed to via [`reap_loop`]'s `SIGCHLD`-driven sweep).
    pub fn remove(&mut self, pid: nix::unistd::Pid) {
        self.workers.retain(|w| w.pid != pid);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
        self.workers.iter_mut()
    }
}

/// Install a `SIGCHLD` listener and reap every exited child via
/// non-blocking `waitpid`, marking the corresponding [`WorkerHandle`]
/// `Exited`.
pub async fn reap_loop(pool_notify: tokio::sync::mpsc::Sender<nix::unistd::Pid>) -> Result<(), WorkerError> {
    let mut sigchld = signal(SignalKind::child()).map_err(WorkerError::Io)?;
    loop {
        sigchld.recv().await;
        loop {
            use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    let _ = pool_notify.send(pid).await;
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_empty() {
        let pool = WorkerPool::new(DEFAULT_WORKER_TIMEOUT);
        assert!(pool.is_empty());
    }
}
