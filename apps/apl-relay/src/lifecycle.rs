//! Per-connection session state machine.
//!
//! A session runs as one task that owns the worker process. Output pumps and
//! the socket writer run beside it; the session task reacts to whichever
//! terminal event arrives first and then drives teardown in a fixed order:
//! closed flag, shutdown directive, `SIGHUP`, `SIGKILL`.

use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::{SessionConfig, ShutdownPolicy};
use crate::error::RelayError;
use crate::multiplexer::{
    forward_inbound, forward_outbound, pump_output, ClosedFlag, RelayCounters, StdinExit,
    StreamKind, WriterExit,
};
use crate::process::{ExitState, WorkerProcess};
use crate::telemetry::{
    FRAMES_IN_TOTAL, FRAMES_OUT_TOTAL, SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL,
    SESSION_DURATION_MS, SPAWN_FAILURES_TOTAL, TEARDOWN_ESCALATIONS_TOTAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Active,
    Closing,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Connecting => "connecting",
            LifecycleState::Active => "active",
            LifecycleState::Closing => "closing",
            LifecycleState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    SpawnFailed(String),
    PeerClosed,
    PeerError(String),
    WorkerExited(ExitState),
    SendFailed(String),
    /// The peer queued more input than the worker consumed.
    InputOverflow,
    ServerShutdown,
}

impl CloseReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            CloseReason::SpawnFailed(_) => "spawn_failed",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::PeerError(_) => "peer_error",
            CloseReason::WorkerExited(_) => "worker_exited",
            CloseReason::SendFailed(_) => "send_failed",
            CloseReason::InputOverflow => "input_overflow",
            CloseReason::ServerShutdown => "server_shutdown",
        }
    }

    fn peer_gone(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::PeerError(_) | CloseReason::SendFailed(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::SpawnFailed(err) => write!(f, "worker launch failed: {err}"),
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::PeerError(err) => f.write_str(err),
            CloseReason::WorkerExited(state) => write!(f, "worker exited ({state:?})"),
            CloseReason::SendFailed(err) => write!(f, "send to peer failed: {err}"),
            CloseReason::InputOverflow => f.write_str("peer input backlog exceeded"),
            CloseReason::ServerShutdown => f.write_str("server shutting down"),
        }
    }
}

/// Transition bookkeeping for one connection.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    reason: Option<CloseReason>,
    closed: ClosedFlag,
}

impl Lifecycle {
    pub fn new(closed: ClosedFlag) -> Self {
        Self {
            state: LifecycleState::Connecting,
            reason: None,
            closed,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn reason(&self) -> Option<&CloseReason> {
        self.reason.as_ref()
    }

    pub fn activate(&mut self) -> bool {
        if self.state != LifecycleState::Connecting {
            return false;
        }
        self.state = LifecycleState::Active;
        true
    }

    /// Enters `Closing`. Returns `false` when teardown already started, so
    /// repeated close or error events are no-ops.
    pub fn begin_close(&mut self, reason: CloseReason) -> bool {
        match self.state {
            LifecycleState::Connecting | LifecycleState::Active => {
                self.closed.close();
                self.state = LifecycleState::Closing;
                self.reason = Some(reason);
                true
            }
            LifecycleState::Closing | LifecycleState::Terminated => false,
        }
    }

    /// Launch failure skips straight to `Terminated`.
    pub fn fail_launch(&mut self, reason: CloseReason) {
        if self.state == LifecycleState::Connecting {
            self.closed.close();
            self.reason = Some(reason);
            self.state = LifecycleState::Terminated;
        }
    }

    pub fn finish(&mut self) {
        if self.state == LifecycleState::Closing {
            self.state = LifecycleState::Terminated;
        }
    }
}

/// One frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Binary and control frames carry nothing for the worker.
    Ignored,
    Close(Option<String>),
}

/// One frame the session hands to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Directive,
    Hangup,
    Kill,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub connection_id: Uuid,
    pub remote: Option<SocketAddr>,
    pub origin: String,
    pub protocol: String,
}

impl SessionContext {
    pub fn new(
        remote: Option<SocketAddr>,
        origin: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            remote,
            origin: origin.into(),
            protocol: protocol.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub connection_id: Uuid,
    pub pid: Option<u32>,
    pub state: LifecycleState,
    pub reason: Option<CloseReason>,
    pub exit: ExitState,
    pub teardown: Vec<TeardownStep>,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub frames_out: u64,
    pub bytes_out: u64,
    pub frames_dropped: u64,
    pub duration: Duration,
}

impl SessionReport {
    fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            pid: None,
            state: LifecycleState::Connecting,
            reason: None,
            exit: ExitState::Running,
            teardown: Vec::new(),
            frames_in: 0,
            bytes_in: 0,
            frames_out: 0,
            bytes_out: 0,
            frames_dropped: 0,
            duration: Duration::ZERO,
        }
    }
}

type WriterResult<Si> = (Si, WriterExit);

/// Runs one connection from worker launch to `Terminated`.
///
/// `inbound` and `outbound` are the two halves of the peer socket. The
/// function returns once the worker has been reaped (or abandoned after the
/// kill grace) and the socket has been closed.
pub async fn run_session<St, E, Si>(
    ctx: SessionContext,
    config: SessionConfig,
    inbound: St,
    outbound: Si,
    shutdown: watch::Receiver<bool>,
) -> SessionReport
where
    St: Stream<Item = Result<InboundFrame, E>> + Unpin + Send,
    E: fmt::Display + Send,
    Si: Sink<OutboundFrame> + Unpin + Send + 'static,
    Si::Error: fmt::Display,
{
    let span = info_span!(
        "session",
        connection_id = %ctx.connection_id,
        origin = %ctx.origin,
        remote = ?ctx.remote,
    );
    drive(ctx, config, inbound, outbound, shutdown)
        .instrument(span)
        .await
}

async fn drive<St, E, Si>(
    ctx: SessionContext,
    config: SessionConfig,
    mut inbound: St,
    mut outbound: Si,
    shutdown: watch::Receiver<bool>,
) -> SessionReport
where
    St: Stream<Item = Result<InboundFrame, E>> + Unpin + Send,
    E: fmt::Display + Send,
    Si: Sink<OutboundFrame> + Unpin + Send + 'static,
    Si::Error: fmt::Display,
{
    let started = Instant::now();
    let closed = ClosedFlag::new();
    let mut lifecycle = Lifecycle::new(closed.clone());
    let mut report = SessionReport::new(ctx.connection_id);

    let mut worker = match WorkerProcess::launch(&config.launch) {
        Ok(worker) => worker,
        Err(err) => {
            error!(error = %err, "worker launch failed; closing connection");
            counter!(SPAWN_FAILURES_TOTAL).increment(1);
            lifecycle.fail_launch(CloseReason::SpawnFailed(err.to_string()));
            if let Err(err) = outbound.send(OutboundFrame::Close).await {
                debug!(error = %err, "close frame not delivered");
            }
            let _ = outbound.close().await;
            report.state = lifecycle.state();
            report.reason = lifecycle.reason().cloned();
            report.duration = started.elapsed();
            return report;
        }
    };

    lifecycle.activate();
    report.pid = worker.pid();
    gauge!(SESSIONS_ACTIVE).increment(1.0);
    info!(
        pid = ?worker.pid(),
        program = worker.program(),
        protocol = %ctx.protocol,
        "session active"
    );

    let (frame_tx, frame_rx) = mpsc::channel(config.frame_buffer);
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = worker.take_stdout() {
        pumps.push(tokio::spawn(pump_output(
            stdout,
            StreamKind::Stdout,
            config.buffer_policy,
            frame_tx.clone(),
        )));
    }
    if let Some(stderr) = worker.take_stderr() {
        pumps.push(tokio::spawn(pump_output(
            stderr,
            StreamKind::Stderr,
            config.buffer_policy,
            frame_tx.clone(),
        )));
    }
    drop(frame_tx);

    let counters = Arc::new(RelayCounters::default());
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
    let (stdin_stop, stdin_stop_rx) = oneshot::channel();
    let stdin_writer = worker.take_stdin().map(|stdin| {
        tokio::spawn(forward_inbound(
            stdin_rx,
            stdin,
            stdin_stop_rx,
            counters.clone(),
        ))
    });
    let mut writer: JoinHandle<WriterResult<Si>> = tokio::spawn(write_frames(
        frame_rx,
        outbound,
        closed.clone(),
        counters.clone(),
    ));
    let mut writer_done: Option<Option<WriterResult<Si>>> = None;

    let shutdown = wait_for_shutdown(shutdown);
    tokio::pin!(shutdown);

    let reason = loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(InboundFrame::Text(text))) => {
                    report.frames_in += 1;
                    let len = text.len();
                    let backlog = counters.stdin_enqueued(len);
                    if stdin_tx.send(text).is_err() {
                        counters.stdin_released(len);
                        trace!("stdin closed; frame dropped");
                    } else if backlog > config.stdin_buffer_bytes as u64 {
                        warn!(backlog, "worker is not reading its input");
                        break CloseReason::InputOverflow;
                    }
                }
                Some(Ok(InboundFrame::Ignored)) => {
                    trace!("non-text frame ignored");
                }
                Some(Ok(InboundFrame::Close(reason))) => {
                    debug!(reason = ?reason, "peer sent close frame");
                    break CloseReason::PeerClosed;
                }
                Some(Err(err)) => {
                    let err = RelayError::Protocol(err.to_string());
                    warn!(error = %err, "socket error; closing session");
                    break CloseReason::PeerError(err.to_string());
                }
                None => {
                    debug!(error = %RelayError::PeerDisconnect, "socket stream ended");
                    break CloseReason::PeerClosed;
                }
            },
            state = worker.exited() => break CloseReason::WorkerExited(state),
            joined = &mut writer, if writer_done.is_none() => {
                let joined = joined_writer(joined);
                let failure = match &joined {
                    Some((_, WriterExit::SendFailed(err))) => Some(err.clone()),
                    Some((_, WriterExit::Drained)) => None,
                    None => Some("writer task failed".to_string()),
                };
                writer_done = Some(joined);
                if let Some(err) = failure {
                    break CloseReason::SendFailed(err);
                }
                // Both worker pipes closed; its exit follows shortly.
            }
            _ = &mut shutdown => break CloseReason::ServerShutdown,
        }
    };

    if matches!(reason, CloseReason::WorkerExited(_)) && writer_done.is_none() {
        // The peer is still there: let output the worker wrote before exiting reach it.
        if let Ok(joined) = timeout(config.shutdown.directive_grace, &mut writer).await {
            writer_done = Some(joined_writer(joined));
        }
    }

    lifecycle.begin_close(reason.clone());
    info!(reason = %reason, "session closing");

    // Queued peer input is discarded; the pipe comes back only if no write was in flight.
    let _ = stdin_stop.send(());
    drop(stdin_tx);
    if let Some(stdin_writer) = stdin_writer {
        match stdin_writer.await {
            Ok(StdinExit::Idle(stdin)) => worker.restore_stdin(stdin),
            Ok(StdinExit::Abandoned) => debug!("stdin pipe abandoned; skipping directive"),
            Err(err) => warn!(error = %err, "stdin writer ended abnormally"),
        }
    }

    report.teardown = teardown(&mut worker, &config.shutdown).await;
    report.exit = worker.exit_state();

    let sink = match writer_done {
        Some(joined) => joined.map(|(sink, _)| sink),
        None => match timeout(config.shutdown.kill_grace, &mut writer).await {
            Ok(joined) => joined_writer(joined).map(|(sink, _)| sink),
            Err(_) => {
                warn!("writer did not finish after teardown; aborting");
                writer.abort();
                None
            }
        },
    };
    if let Some(mut sink) = sink {
        if !reason.peer_gone() {
            if let Err(err) = sink.send(OutboundFrame::Close).await {
                debug!(error = %err, "close frame not delivered");
            }
        }
        let _ = sink.close().await;
    }
    for pump in pumps {
        // A grandchild that inherited the pipes can keep them open after the worker died.
        pump.abort();
    }

    lifecycle.finish();
    gauge!(SESSIONS_ACTIVE).decrement(1.0);

    report.state = lifecycle.state();
    report.reason = lifecycle.reason().cloned();
    report.bytes_in = counters.bytes_in();
    report.frames_out = counters.frames_out();
    report.bytes_out = counters.bytes_out();
    report.frames_dropped = counters.frames_dropped();
    report.duration = started.elapsed();

    record_session_metrics(&report);

    info!(
        state = report.state.as_str(),
        exit = ?report.exit,
        teardown = ?report.teardown,
        frames_in = report.frames_in,
        frames_out = report.frames_out,
        frames_dropped = report.frames_dropped,
        "session terminated"
    );
    report
}

/// Stops the worker: directive on stdin, then `SIGHUP`, then `SIGKILL`.
///
/// Every step is skipped once the worker has exited, so calling this on an
/// already-stopped worker does nothing.
pub async fn teardown(worker: &mut WorkerProcess, policy: &ShutdownPolicy) -> Vec<TeardownStep> {
    let mut steps = Vec::new();
    if worker.has_exited() {
        worker.close_stdin().await;
        return steps;
    }

    if worker.stdin_open() {
        let directive = format!("{}\n", policy.directive);
        match timeout(policy.directive_grace, worker.write_stdin(directive.as_bytes())).await {
            Ok(true) => steps.push(TeardownStep::Directive),
            Ok(false) => {}
            Err(_) => debug!(pid = ?worker.pid(), "stdin full; shutdown directive not delivered"),
        }
    }
    worker.close_stdin().await;
    if worker.wait_exit(policy.directive_grace).await.is_some() {
        return steps;
    }

    if worker.signal_hangup() {
        steps.push(TeardownStep::Hangup);
    }
    if worker.wait_exit(policy.signal_grace).await.is_some() {
        return steps;
    }

    if worker.signal_kill() {
        steps.push(TeardownStep::Kill);
        counter!(TEARDOWN_ESCALATIONS_TOTAL).increment(1);
        warn!(pid = ?worker.pid(), "worker ignored shutdown; killed");
    }
    if worker.wait_exit(policy.kill_grace).await.is_none() {
        error!(pid = ?worker.pid(), "worker still running after SIGKILL");
    }
    steps
}

fn record_session_metrics(report: &SessionReport) {
    counter!(FRAMES_IN_TOTAL).increment(report.frames_in);
    counter!(FRAMES_OUT_TOTAL).increment(report.frames_out);
    if let Some(reason) = &report.reason {
        counter!(SESSIONS_CLOSED_TOTAL, "reason" => reason.metric_label()).increment(1);
    }
    histogram!(SESSION_DURATION_MS).record(report.duration.as_secs_f64() * 1000.0);
}

async fn write_frames<Si>(
    rx: mpsc::Receiver<String>,
    mut sink: Si,
    closed: ClosedFlag,
    counters: Arc<RelayCounters>,
) -> WriterResult<Si>
where
    Si: Sink<OutboundFrame> + Unpin,
    Si::Error: fmt::Display,
{
    let exit = forward_outbound(rx, &mut sink, closed, counters, OutboundFrame::Text).await;
    (sink, exit)
}

fn joined_writer<Si>(
    joined: Result<WriterResult<Si>, tokio::task::JoinError>,
) -> Option<WriterResult<Si>> {
    match joined {
        Ok(result) => Some(result),
        Err(err) => {
            warn!(error = %err, "writer task ended abnormally");
            None
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Nobody can request a shutdown any more.
        std::future::pending::<()>().await;
    }
}
