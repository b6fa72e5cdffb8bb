//! Worker process handle.
//!
//! A [`WorkerProcess`] owns one spawned interpreter. The child itself lives
//! inside an exit-watcher task so the exit status can be published to any
//! number of observers while the handle keeps the stdin pipe and the pid for
//! signalling.

use std::{
    ffi::OsStr,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::error::{RelayError, Result};

/// Fixed program and argument vector used to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContract {
    program: PathBuf,
    args: Vec<String>,
}

impl LaunchContract {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.args.iter().map(OsStr::new))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitState {
    fn from_status(status: ExitStatus) -> Self {
        ExitState::Exited {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, ExitState::Exited { .. })
    }
}

/// Signal requests for the exit watcher. Only the watcher may signal the
/// child: it is also the only one that reaps it, so the pid cannot be
/// recycled between the liveness check and the `kill`.
#[derive(Debug)]
struct SignalLine {
    tx: mpsc::UnboundedSender<libc::c_int>,
}

impl SignalLine {
    fn send(&self, signal: libc::c_int) -> bool {
        // The watcher is gone once the child has been reaped.
        self.tx.send(signal).is_ok()
    }
}

pub struct WorkerProcess {
    pid: Option<u32>,
    program: String,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_rx: watch::Receiver<ExitState>,
    signals: SignalLine,
    watcher: JoinHandle<()>,
}

impl WorkerProcess {
    pub fn launch(contract: &LaunchContract) -> Result<Self> {
        let program = contract.program().display().to_string();
        let mut child = contract.command().spawn().map_err(|source| RelayError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_exit(child, exit_tx, signal_rx));

        debug!(pid = ?pid, program = %program, "worker launched");

        Ok(Self {
            pid,
            program,
            stdin,
            stdout,
            stderr,
            exit_rx,
            signals: SignalLine { tx: signal_tx },
            watcher,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    pub fn exit_state(&self) -> ExitState {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_state().has_exited()
    }

    /// Receiver that flips to [`ExitState::Exited`] once the child is reaped.
    pub fn exit_notifier(&self) -> watch::Receiver<ExitState> {
        self.exit_rx.clone()
    }

    /// Resolves once the worker has exited.
    pub async fn exited(&self) -> ExitState {
        let mut rx = self.exit_rx.clone();
        let state = match rx.wait_for(ExitState::has_exited).await {
            Ok(state) => *state,
            // Sender dropped without publishing: the watcher was aborted.
            Err(_) => ExitState::Exited {
                code: None,
                signal: None,
            },
        };
        state
    }

    /// Waits up to `grace` for the worker to exit.
    pub async fn wait_exit(&self, grace: Duration) -> Option<ExitState> {
        tokio::time::timeout(grace, self.exited()).await.ok()
    }

    /// Hands the stdin pipe to a dedicated writer.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Returns a pipe taken with [`WorkerProcess::take_stdin`].
    pub fn restore_stdin(&mut self, stdin: ChildStdin) {
        self.stdin = Some(stdin);
    }

    pub fn stdin_open(&self) -> bool {
        self.stdin.is_some() && !self.has_exited()
    }

    /// Writes `bytes` to the worker's stdin. Returns `false` when the bytes
    /// were dropped because the worker is gone or its stdin is closed.
    pub async fn write_stdin(&mut self, bytes: &[u8]) -> bool {
        if self.has_exited() {
            trace!(pid = ?self.pid, "stdin write after exit dropped");
            self.stdin = None;
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            trace!(pid = ?self.pid, "stdin write after close dropped");
            return false;
        };

        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    pid = ?self.pid,
                    error = %err,
                    reason = RelayError::BrokenPipe.metric_label(),
                    "worker stdin write failed; closing stdin"
                );
                self.stdin = None;
                false
            }
        }
    }

    /// Closes stdin so the worker observes end of input.
    pub async fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Requests `SIGHUP`. Does nothing once the worker has exited.
    pub fn signal_hangup(&self) -> bool {
        self.signal(libc::SIGHUP)
    }

    /// Requests `SIGKILL`. Does nothing once the worker has exited.
    pub fn signal_kill(&self) -> bool {
        self.signal(libc::SIGKILL)
    }

    fn signal(&self, signal: libc::c_int) -> bool {
        !self.has_exited() && self.signals.send(signal)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.signals.send(libc::SIGKILL);
        } else {
            self.watcher.abort();
        }
    }
}

async fn watch_exit(
    mut child: Child,
    exit_tx: watch::Sender<ExitState>,
    mut signal_rx: mpsc::UnboundedReceiver<libc::c_int>,
) {
    let pid = child.id();
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = signal_rx.recv() => match request {
                Some(libc::SIGKILL) => {
                    if let Err(err) = child.start_kill() {
                        debug!(pid = ?pid, error = %err, "start_kill failed");
                    }
                }
                Some(signal) => deliver(&child, signal),
                // Handle dropped: make sure the child does not outlive it.
                None => {
                    let _ = child.start_kill();
                    break child.wait().await;
                }
            },
        }
    };

    let state = match status {
        Ok(status) => ExitState::from_status(status),
        Err(err) => {
            warn!(pid = ?pid, error = %err, "failed to reap worker");
            ExitState::Exited {
                code: None,
                signal: None,
            }
        }
    };
    debug!(pid = ?pid, state = ?state, "worker exited");
    exit_tx.send_replace(state);
}

fn deliver(child: &Child, signal: libc::c_int) {
    // `id()` is `None` once the child has been reaped.
    let Some(pid) = child.id() else {
        return;
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid, signal, error = %err, "signal delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> LaunchContract {
        LaunchContract::new("/bin/sh", ["-c", script])
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn missing_executable_is_a_spawn_error() {
        let contract = LaunchContract::new("/nonexistent/apl", Vec::<String>::new());
        match WorkerProcess::launch(&contract) {
            Err(RelayError::Spawn { program, .. }) => assert_eq!(program, "/nonexistent/apl"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("launch should fail"),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stdin_round_trips_through_cat() {
        let mut worker = WorkerProcess::launch(&LaunchContract::new(
            "/bin/cat",
            Vec::<String>::new(),
        ))
        .expect("launch cat");
        let mut stdout = worker.take_stdout().expect("stdout");

        assert!(worker.write_stdin(b"1+1\n").await);
        worker.close_stdin().await;

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "1+1\n");

        let state = worker.exited().await;
        assert_eq!(
            state,
            ExitState::Exited {
                code: Some(0),
                signal: None
            }
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn self_exit_is_notified_and_stdin_writes_are_dropped() {
        let mut worker = WorkerProcess::launch(&sh("exit 3")).expect("launch");
        let mut notifier = worker.exit_notifier();
        notifier
            .wait_for(ExitState::has_exited)
            .await
            .expect("exit published");

        assert_eq!(
            worker.exit_state(),
            ExitState::Exited {
                code: Some(3),
                signal: None
            }
        );
        assert!(!worker.write_stdin(b"ignored\n").await);
        assert!(!worker.stdin_open());
        assert!(!worker.signal_hangup());
        assert!(!worker.signal_kill());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn hangup_then_kill_is_idempotent() {
        let worker = WorkerProcess::launch(&sh("trap '' HUP; while :; do sleep 0.05; done"))
            .expect("launch");

        assert!(worker.signal_hangup());
        assert!(worker.wait_exit(Duration::from_millis(200)).await.is_none());

        assert!(worker.signal_kill());
        worker.signal_kill();
        let state = worker
            .wait_exit(Duration::from_secs(5))
            .await
            .expect("killed worker exits");
        assert_eq!(
            state,
            ExitState::Exited {
                code: None,
                signal: Some(libc::SIGKILL)
            }
        );
        assert!(!worker.signal_kill());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn hangup_is_delivered_by_the_watcher() {
        let worker = WorkerProcess::launch(&sh("while :; do sleep 0.05; done")).expect("launch");

        assert!(worker.signal_hangup());
        let state = worker
            .wait_exit(Duration::from_secs(5))
            .await
            .expect("hung up worker exits");
        assert_eq!(
            state,
            ExitState::Exited {
                code: None,
                signal: Some(libc::SIGHUP)
            }
        );
        // Reaped: no signal may reach whatever reuses the pid.
        assert!(!worker.signal_hangup());
        assert!(!worker.signal_kill());
    }
}
