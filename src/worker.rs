// SPDX-License-Identifier: MIT
//! Worker — one backend subprocess bound to one loopback port.
//!
//! A worker owns its subprocess, a merged stdout+stderr log stream, and a
//! cancellation handle. It never restarts itself; that's the supervisor's
//! job. Once a worker's `done` signal has fired it is a terminal value —
//! dead, no longer a valid dispatch target, safe to keep around only for
//! whatever `Arc` clones still point at it.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CommandSpec;

/// Failure to start a worker's subprocess. Logged, never propagated —
/// a failed spawn still yields a `Worker` (already dead, pid 0) so callers
/// have a uniform handle regardless of outcome.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn worker subprocess: {0}")]
struct SpawnError(#[from] std::io::Error);

/// One supervised backend subprocess.
pub struct Worker {
    /// Loopback port the subprocess was told to bind.
    pub port: u16,
    /// OS process id, 0 if the subprocess never started.
    pid: AtomicU32,
    /// Cancelling this tells the watcher task to kill the subprocess.
    token: CancellationToken,
    /// Fires exactly once, after the subprocess has been reaped.
    done: Notify,
    done_fired: std::sync::atomic::AtomicBool,
}

impl Worker {
    /// Start a subprocess bound to `port` and return a handle to it
    /// immediately; the watcher task runs in the background.
    ///
    /// `parent` is the cancellation this worker's token is a child of —
    /// typically a fresh top-level token per worker so that tearing one
    /// worker down never cascades to its siblings (see `supervisor`).
    pub fn spawn(parent: &CancellationToken, port: u16, command: &CommandSpec) -> Arc<Self> {
        let token = parent.child_token();
        let args = command.args_for_port(port);

        let mut cmd = Command::new(&command.program);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        // New process group so cancel() can signal the whole subtree, not
        // just the direct child. Platforms without process groups just get
        // direct-child termination (see `cancel`).
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let worker = Arc::new(Self {
            port,
            pid: AtomicU32::new(0),
            token,
            done: Notify::new(),
            done_fired: std::sync::atomic::AtomicBool::new(false),
        });

        match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id().unwrap_or(0);
                worker.pid.store(pid, Ordering::SeqCst);
                info!(port, pid, program = %command.program, "worker spawned");

                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                tokio::spawn(log_reader(port, pid, stdout, stderr));

                let watcher = worker.clone();
                tokio::spawn(async move {
                    watcher.watch(child).await;
                });
            }
            Err(e) => {
                let err = SpawnError::from(e);
                error!(port, program = %command.program, err = %err, "failed to spawn worker — marking dead immediately");
                worker.token.cancel();
                worker.fire_done();
            }
        }

        worker
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Build a worker handle with no real subprocess behind it, for unit
    /// tests of the pool/dispatcher that only care about liveness and port
    /// identity, not actual process lifecycle.
    #[cfg(test)]
    pub(crate) fn for_test(port: u16, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            port,
            pid: AtomicU32::new(0),
            token,
            done: Notify::new(),
            done_fired: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn is_dead(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves as soon as the worker is cancelled — unlike `wait_done`,
    /// this does not wait for the subprocess to actually be reaped, only
    /// for termination to have been *requested*. Used by the supervisor to
    /// abandon permit publication the moment a worker starts dying, rather
    /// than waiting for the full kill-and-reap sequence to finish.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Force termination: kill the direct child and SIGTERM the whole
    /// process group. Idempotent — safe to call from multiple requests
    /// racing to kill the same stuck worker.
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        warn!(port = self.port, pid = self.pid(), "cancelling worker");
        self.token.cancel();
    }

    /// Resolve once the subprocess has been reaped and stdio closed.
    pub async fn wait_done(&self) {
        if self.done_fired.load(Ordering::SeqCst) {
            return;
        }
        self.done.notified().await;
    }

    fn fire_done(&self) {
        if !self.done_fired.swap(true, Ordering::SeqCst) {
            self.done.notify_waiters();
        }
    }

    /// Running -> Terminating -> Dead. Owns the `Child`.
    async fn watch(self: Arc<Self>, mut child: tokio::process::Child) {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(port = self.port, pid = self.pid(), %status, "worker exited"),
                    Err(e) => error!(port = self.port, pid = self.pid(), err = %e, "error waiting for worker"),
                }
                self.token.cancel();
            }
            _ = self.token.cancelled() => {
                self.terminate(&mut child).await;
            }
        }
        self.fire_done();
    }

    async fn terminate(&self, child: &mut tokio::process::Child) {
        let pid = self.pid();
        debug!(port = self.port, pid, "terminating worker");

        // (a) kill the direct process.
        let _ = child.start_kill();

        // (b) SIGTERM the whole process group so non-cooperative descendants
        // spawned by the backend are collected too. No-op on platforms
        // without process groups.
        #[cfg(unix)]
        if pid != 0 {
            // SAFETY: pid came from a child we spawned into its own process
            // group; negating it targets that group, not an arbitrary PID.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
            }
        }

        let _ = child.wait().await;
    }
}

async fn log_reader(
    port: u16,
    pid: u32,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) {
    // Each stream reads to EOF or error independently. A read error ends
    // ingestion for that stream only — it never reaches back to cancel the
    // worker; that's `watch`'s job alone.
    let stdout_task = stdout.map(|out| tokio::spawn(drain_lines(port, pid, "stdout", out)));
    let stderr_task = stderr.map(|err| tokio::spawn(drain_lines(port, pid, "stderr", err)));

    if let Some(t) = stdout_task {
        let _ = t.await;
    }
    if let Some(t) = stderr_task {
        let _ = t.await;
    }
}

async fn drain_lines<R: tokio::io::AsyncRead + Unpin>(
    port: u16,
    pid: u32,
    stream: &'static str,
    reader: R,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(port, pid, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                warn!(port, pid, stream, err = %e, "log read error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    #[tokio::test]
    async fn spawn_failure_marks_worker_dead_immediately() {
        let parent = CancellationToken::new();
        let command = CommandSpec::new("/no/such/binary-hss-test".into(), vec![]);
        let worker = Worker::spawn(&parent, 1, &command);
        worker.wait_done().await;
        assert!(worker.is_dead());
        assert_eq!(worker.pid(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let parent = CancellationToken::new();
        let command = CommandSpec::new("sleep".into(), vec!["30".into()]);
        let worker = Worker::spawn(&parent, 2, &command);
        worker.cancel();
        worker.cancel();
        worker.wait_done().await;
        assert!(worker.is_dead());
    }
}
