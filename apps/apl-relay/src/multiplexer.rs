//! Byte pumps between a worker's standard streams and a websocket.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use futures_util::{Sink, SinkExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tracing::{debug, trace, warn};

use crate::error::RelayError;

const READ_CHUNK: usize = 4096;

/// How worker output is cut into outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BufferPolicy {
    /// One frame per chunk read from the pipe.
    Passthrough,
    /// Complete lines only; a trailing partial line waits for the next chunk.
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Set once a connection starts closing; never cleared.
#[derive(Debug, Clone, Default)]
pub struct ClosedFlag(Arc<AtomicBool>);

impl ClosedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pending output of one stream that does not yet form a frame.
#[derive(Debug)]
pub struct OutputBuffer {
    policy: BufferPolicy,
    pending: Vec<u8>,
}

impl OutputBuffer {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Appends a chunk and returns the frame that is ready to send, if any.
    ///
    /// An incomplete trailing UTF-8 sequence is always held back so frames
    /// stay valid text without altering the byte stream.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);
        let ready = match self.policy {
            BufferPolicy::Passthrough => utf8_boundary(&self.pending),
            BufferPolicy::Line => self
                .pending
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |idx| idx + 1),
        };
        self.split_frame(ready)
    }

    /// Drains whatever is left at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        let len = self.pending.len();
        self.split_frame(len)
    }

    fn split_frame(&mut self, len: usize) -> Option<String> {
        if len == 0 {
            return None;
        }
        let rest = self.pending.split_off(len);
        let bytes = std::mem::replace(&mut self.pending, rest);
        Some(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        })
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A sequence is at most four bytes, so only the tail needs inspecting.
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return len,
        };
        return if width > back { len - back } else { len };
    }
    len
}

#[derive(Debug, Default)]
pub struct RelayCounters {
    bytes_in: AtomicU64,
    stdin_queued: AtomicU64,
    frames_out: AtomicU64,
    bytes_out: AtomicU64,
    frames_dropped: AtomicU64,
}

impl RelayCounters {
    /// Bytes that reached the worker's stdin.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes accepted from the peer but not yet written to stdin.
    pub fn stdin_queued(&self) -> u64 {
        self.stdin_queued.load(Ordering::Relaxed)
    }

    /// Accounts for a frame about to be queued; returns the new backlog.
    pub(crate) fn stdin_enqueued(&self, len: usize) -> u64 {
        self.stdin_queued.fetch_add(len as u64, Ordering::Relaxed) + len as u64
    }

    pub(crate) fn stdin_released(&self, len: usize) {
        self.stdin_queued.fetch_sub(len as u64, Ordering::Relaxed);
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Reads `reader` until end of stream and queues frames on `tx`.
///
/// The bounded channel provides back-pressure: when the writer is slow the
/// pump stops reading and the pipe fills up in the worker.
pub async fn pump_output<R>(
    mut reader: R,
    kind: StreamKind,
    policy: BufferPolicy,
    tx: mpsc::Sender<String>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = OutputBuffer::new(policy);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(stream = kind.as_str(), bytes = n, "worker output");
                if let Some(frame) = buffer.push(&chunk[..n]) {
                    if tx.send(frame).await.is_err() {
                        debug!(stream = kind.as_str(), "frame channel closed; pump stopping");
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(stream = kind.as_str(), error = %err, "failed to read worker output");
                break;
            }
        }
    }
    if let Some(frame) = buffer.flush() {
        let _ = tx.send(frame).await;
    }
    debug!(stream = kind.as_str(), "worker stream finished");
}

/// How the stdin writer ended.
#[derive(Debug)]
pub enum StdinExit<W> {
    /// Stopped between frames; the pipe can still carry the shutdown directive.
    Idle(W),
    /// Stopped inside a write or after a failed one; the pipe is dropped.
    Abandoned,
}

/// Writes queued peer frames to the worker's stdin, in order, until `stop`
/// fires or the queue closes.
///
/// Runs beside the session loop so a worker that stops reading its input
/// can never keep the session from noticing a disconnect. Frames still
/// queued when `stop` fires are discarded.
pub async fn forward_inbound<W>(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut stdin: W,
    mut stop: oneshot::Receiver<()>,
    counters: Arc<RelayCounters>,
) -> StdinExit<W>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => return StdinExit::Idle(stdin),
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return StdinExit::Idle(stdin),
            },
        };

        let write = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.flush().await
        };
        let result = tokio::select! {
            result = write => result,
            _ = &mut stop => {
                debug!(pending = frame.len(), "stdin write interrupted by teardown");
                return StdinExit::Abandoned;
            }
        };
        counters.stdin_released(frame.len());
        match result {
            Ok(()) => {
                counters
                    .bytes_in
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    reason = RelayError::BrokenPipe.metric_label(),
                    "worker stdin write failed; dropping further input"
                );
                return StdinExit::Abandoned;
            }
        }
    }
}

/// Why the writer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterExit {
    /// Every pump finished and all queued frames were handled.
    Drained,
    /// The socket refused a frame.
    SendFailed(String),
}

/// Drains queued frames into `sink` until every pump has finished.
///
/// The closed flag is consulted immediately before each send; frames that
/// arrive for a closing connection are counted and discarded.
pub async fn forward_outbound<S, T, F>(
    mut rx: mpsc::Receiver<String>,
    sink: &mut S,
    closed: ClosedFlag,
    counters: Arc<RelayCounters>,
    encode: F,
) -> WriterExit
where
    S: Sink<T> + Unpin,
    S::Error: std::fmt::Display,
    F: Fn(String) -> T,
{
    while let Some(frame) = rx.recv().await {
        if closed.is_closed() {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(bytes = frame.len(), "frame for closed connection discarded");
            continue;
        }
        let len = frame.len() as u64;
        if let Err(err) = sink.send(encode(frame)).await {
            warn!(error = %err, "failed to send frame to peer");
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return WriterExit::SendFailed(err.to_string());
        }
        counters.frames_out.fetch_add(1, Ordering::Relaxed);
        counters.bytes_out.fetch_add(len, Ordering::Relaxed);
    }
    WriterExit::Drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{channel::mpsc as fmpsc, StreamExt};

    #[test_timeout::timeout]
    fn passthrough_emits_each_chunk() {
        let mut buffer = OutputBuffer::new(BufferPolicy::Passthrough);
        assert_eq!(buffer.push(b"\"par").as_deref(), Some("\"par"));
        assert_eq!(buffer.push(b"tial\n\"").as_deref(), Some("tial\n\""));
        assert!(buffer.flush().is_none());
    }

    #[test_timeout::timeout]
    fn line_policy_reassembles_partial_lines() {
        let mut buffer = OutputBuffer::new(BufferPolicy::Line);
        assert!(buffer.push(b"par").is_none());
        assert_eq!(buffer.pending(), b"par");
        assert_eq!(buffer.push(b"tial\n").as_deref(), Some("partial\n"));
        assert!(buffer.pending().is_empty());

        assert_eq!(buffer.push(b"a\nb\nc").as_deref(), Some("a\nb\n"));
        assert_eq!(buffer.flush().as_deref(), Some("c"));
    }

    #[test_timeout::timeout]
    fn split_utf8_sequences_are_held_back() {
        let text = "⍳5\n";
        let bytes = text.as_bytes();
        let mut buffer = OutputBuffer::new(BufferPolicy::Passthrough);
        assert!(buffer.push(&bytes[..1]).is_none());
        assert!(buffer.push(&bytes[1..2]).is_none());
        assert_eq!(buffer.push(&bytes[2..]).as_deref(), Some(text));
    }

    #[test_timeout::timeout]
    fn frames_reconstruct_the_stream_under_both_policies() {
        let output = "      ⍳3\n1 2 3\n      'partial".as_bytes();
        for policy in [BufferPolicy::Passthrough, BufferPolicy::Line] {
            for step in [1usize, 2, 5, 64] {
                let mut buffer = OutputBuffer::new(policy);
                let mut rebuilt = String::new();
                for chunk in output.chunks(step) {
                    if let Some(frame) = buffer.push(chunk) {
                        rebuilt.push_str(&frame);
                    }
                }
                if let Some(frame) = buffer.flush() {
                    rebuilt.push_str(&frame);
                }
                assert_eq!(rebuilt.as_bytes(), output, "{policy:?} step {step}");
            }
        }
    }

    #[test_timeout::timeout]
    fn closed_flag_is_monotonic() {
        let flag = ClosedFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_closed());
        assert!(flag.close());
        assert!(!flag.close());
        assert!(observer.is_closed());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn pump_flushes_partial_line_at_end_of_stream() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_output(reader, StreamKind::Stdout, BufferPolicy::Line, tx));

        writer.write_all(b"\"par").await.expect("write");
        writer.flush().await.expect("flush");
        tokio::task::yield_now().await;
        writer.write_all(b"tial\n").await.expect("write");
        writer.write_all(b"tail").await.expect("write");
        drop(writer);

        pump.await.expect("pump");
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames.concat(), "\"partial\ntail");
        assert_eq!(frames.last().map(String::as_str), Some("tail"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn writer_skips_frames_once_closed() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (mut sink, mut delivered) = fmpsc::unbounded::<String>();
        let closed = ClosedFlag::new();
        let counters = Arc::new(RelayCounters::default());

        frame_tx.send("first".into()).await.expect("queue");
        let writer_closed = closed.clone();
        let writer_counters = counters.clone();
        let writer = tokio::spawn(async move {
            forward_outbound(
                frame_rx,
                &mut sink,
                writer_closed,
                writer_counters,
                |text: String| text,
            )
            .await
        });

        assert_eq!(delivered.next().await.as_deref(), Some("first"));
        closed.close();
        frame_tx.send("late".into()).await.expect("queue");
        drop(frame_tx);

        assert_eq!(writer.await.expect("writer"), WriterExit::Drained);
        assert_eq!(counters.frames_out(), 1);
        assert_eq!(counters.frames_dropped(), 1);
        assert!(delivered.next().await.is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stdin_writer_keeps_order_and_hands_the_pipe_back() {
        let (pipe, mut worker_side) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(RelayCounters::default());
        let writer = tokio::spawn(forward_inbound(rx, pipe, stop_rx, counters.clone()));

        for frame in ["1+1\n", "⍳3\n"] {
            counters.stdin_enqueued(frame.len());
            tx.send(frame.to_string()).expect("queue");
        }
        let mut received = vec![0u8; "1+1\n⍳3\n".len()];
        worker_side.read_exact(&mut received).await.expect("read");
        assert_eq!(received, "1+1\n⍳3\n".as_bytes());

        stop_tx.send(()).expect("stop");
        assert!(matches!(writer.await.expect("writer"), StdinExit::Idle(_)));
        assert_eq!(counters.bytes_in(), received.len() as u64);
        assert_eq!(counters.stdin_queued(), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stdin_writer_gives_up_on_a_pipe_nobody_reads() {
        // Nobody drains the other end, so the write stalls once 16 bytes are buffered.
        let (pipe, _worker_side) = tokio::io::duplex(16);
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(RelayCounters::default());
        let writer = tokio::spawn(forward_inbound(rx, pipe, stop_rx, counters.clone()));

        let frame = "x".repeat(4096);
        counters.stdin_enqueued(frame.len());
        tx.send(frame).expect("queue");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        stop_tx.send(()).expect("stop");
        let exit = tokio::time::timeout(std::time::Duration::from_secs(1), writer)
            .await
            .expect("writer stops promptly")
            .expect("writer");
        assert!(matches!(exit, StdinExit::Abandoned));
        assert_eq!(counters.bytes_in(), 0);
    }
}
