use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec;
use crate::frame::{Frame, WINDOW_FRAMES};
use crate::stream::MuxStream;

/// How long a shutdown waits for the child to exit on its own (the closed
/// pipe is its cue) before killing it.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Backlog of inbound streams not yet picked up by `accept`.
const ACCEPT_BACKLOG: usize = 64;

/// Outbound frame queue depth shared by all streams.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Which end of the pipe this session is. The two ends must disagree: the
/// parity of allocated stream ids depends on it, and the server end is the
/// one that owns a spawned child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    fn first_stream_id(self) -> u32 {
        match self {
            Mode::Client => 1,
            Mode::Server => 2,
        }
    }
}

pub(crate) enum StreamEvent {
    Data(Vec<u8>),
    Eof,
    Reset,
}

pub(crate) struct StreamSlot {
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    send_window: Arc<Semaphore>,
}

pub(crate) struct Shared {
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    /// Bounded queue for `Open`/`Data`/graceful `Close`; backpressure from
    /// the pipe propagates to writers through here.
    pub(crate) data_tx: mpsc::Sender<Frame>,
    /// Unbounded side channel for frames that must never wait behind data
    /// (window updates, resets, drop-time closes).
    pub(crate) control_tx: mpsc::UnboundedSender<Frame>,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    fn register_stream(self: &Arc<Self>, stream_id: u32) -> MuxStream {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(Semaphore::new(WINDOW_FRAMES));
        self.streams.lock().unwrap().insert(
            stream_id,
            StreamSlot {
                event_tx,
                send_window: send_window.clone(),
            },
        );
        MuxStream::new(stream_id, Arc::clone(self), event_rx, send_window)
    }

    pub(crate) fn release_stream(&self, stream_id: u32) {
        self.streams.lock().unwrap().remove(&stream_id);
    }

    /// Fail every outstanding stream: readers observe a reset, writers
    /// blocked on window credit wake up with a closed semaphore.
    fn fail_all_streams(&self) {
        let mut streams = self.streams.lock().unwrap();
        for (_, slot) in streams.drain() {
            slot.send_window.close();
            let _ = slot.event_tx.send(StreamEvent::Reset);
        }
    }
}

/// One end of the multiplexed pipe. Holds the accept side; cheap handles for
/// opening streams ([`MuxOpener`]) and tearing the session down
/// ([`MuxControl`]) can be split off and cloned freely.
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: mpsc::Receiver<MuxStream>,
    control: MuxControl,
}

impl MuxSession {
    /// Multiplex over an arbitrary read/write pair.
    pub fn new<R, W>(reader: R, writer: W, mode: Mode) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::build(reader, writer, mode, None)
    }

    /// Client end over this process's own stdin/stdout. The agent runs this;
    /// nothing else may touch stdout afterwards.
    pub fn over_stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), Mode::Client)
    }

    /// Server end over a spawned child's stdin/stdout. The session owns the
    /// child; [`MuxControl::shutdown`] waits for it.
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not piped"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not piped"))?;
        Ok(Self::build(stdout, stdin, Mode::Server, Some(child)))
    }

    fn build<R, W>(reader: R, writer: W, mode: Mode, child: Option<Child>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (data_tx, data_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            next_id: AtomicU32::new(mode.first_stream_id()),
            streams: Mutex::new(HashMap::new()),
            data_tx,
            control_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(reader, Arc::clone(&shared), accept_tx));
        tokio::spawn(write_loop(
            writer,
            data_rx,
            control_rx,
            shared.shutdown.clone(),
        ));

        let control = MuxControl {
            shared: Arc::clone(&shared),
            child: Arc::new(tokio::sync::Mutex::new(child)),
        };

        Self {
            shared,
            accept_rx,
            control,
        }
    }

    /// Next stream opened by the peer, in open order. `None` once the
    /// session is down.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.accept_rx.recv().await
    }

    /// Open a new outbound stream.
    pub async fn open(&self) -> io::Result<MuxStream> {
        self.opener().open().await
    }

    pub fn opener(&self) -> MuxOpener {
        MuxOpener {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn control(&self) -> MuxControl {
        self.control.clone()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        // Dropping the accept side tears the whole session down; the pump
        // tasks exit and the pipe closes behind them.
        self.shared.shutdown.cancel();
        self.shared.fail_all_streams();
    }
}

/// Cloneable handle for opening streams.
#[derive(Clone)]
pub struct MuxOpener {
    shared: Arc<Shared>,
}

impl MuxOpener {
    pub async fn open(&self) -> io::Result<MuxStream> {
        if self.shared.shutdown.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let stream_id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register_stream(stream_id);
        if self
            .shared
            .data_tx
            .send(Frame::Open { stream_id })
            .await
            .is_err()
        {
            self.shared.release_stream(stream_id);
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(stream)
    }
}

/// Cloneable teardown handle. Shutdown is idempotent: it cancels both pump
/// tasks, fails outstanding streams and, on the server end, reaps the child.
#[derive(Clone)]
pub struct MuxControl {
    shared: Arc<Shared>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
}

impl MuxControl {
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.fail_all_streams();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            // The write loop has dropped the child's stdin by now; give it a
            // moment to notice the EOF and exit before forcing the issue.
            match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "child exited"),
                Ok(Err(e)) => warn!(%e, "failed to reap child"),
                Err(_) => {
                    warn!("child did not exit after pipe close, killing it");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, accept_tx: mpsc::Sender<MuxStream>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = codec::read_frame(&mut reader) => match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("mux pipe closed: {e}");
                    break;
                }
            },
        };

        match frame {
            Frame::Open { stream_id } => {
                let stream = shared.register_stream(stream_id);
                if accept_tx.send(stream).await.is_err() {
                    shared.release_stream(stream_id);
                    let _ = shared.control_tx.send(Frame::Reset { stream_id });
                }
            }
            Frame::Data { stream_id, payload } => {
                let streams = shared.streams.lock().unwrap();
                if let Some(slot) = streams.get(&stream_id) {
                    let _ = slot.event_tx.send(StreamEvent::Data(payload));
                }
                // Data for a stream we already dropped is discarded.
            }
            Frame::WindowUpdate { stream_id, delta } => {
                let streams = shared.streams.lock().unwrap();
                if let Some(slot) = streams.get(&stream_id) {
                    slot.send_window.add_permits(delta as usize);
                }
            }
            Frame::Close { stream_id } => {
                let streams = shared.streams.lock().unwrap();
                if let Some(slot) = streams.get(&stream_id) {
                    let _ = slot.event_tx.send(StreamEvent::Eof);
                }
            }
            Frame::Reset { stream_id } => {
                let mut streams = shared.streams.lock().unwrap();
                if let Some(slot) = streams.remove(&stream_id) {
                    slot.send_window.close();
                    let _ = slot.event_tx.send(StreamEvent::Reset);
                }
            }
        }
    }

    shared.shutdown.cancel();
    shared.fail_all_streams();
}

async fn write_loop<W>(
    mut writer: W,
    mut data_rx: mpsc::Receiver<Frame>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            frame = control_rx.recv() => frame,
            frame = data_rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = codec::write_frame(&mut writer, &frame).await {
            debug!(stream_id = frame.stream_id(), "mux write failed: {e}");
            break;
        }
    }
    shutdown.cancel();
    // Dropping the writer closes the pipe; for a child this is its stdin and
    // its signal to exit.
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_DATA_LEN;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(512 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            MuxSession::new(ar, aw, Mode::Server),
            MuxSession::new(br, bw, Mode::Client),
        )
    }

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (mut server, client) = session_pair();

        let mut outbound = client.open().await.expect("open failed");
        outbound.write_all(b"hello").await.expect("write failed");

        let mut inbound = server.accept().await.expect("accept returned None");
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.expect("write failed");
        outbound.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn stream_ids_use_opposite_parity() {
        let (mut server, mut client) = session_pair();

        let from_client = client.open().await.expect("open failed");
        let from_server = server.open().await.expect("open failed");
        assert_eq!(from_client.id() % 2, 1);
        assert_eq!(from_server.id() % 2, 0);

        // Both directions accept the peer's stream.
        assert!(server.accept().await.is_some());
        assert!(client.accept().await.is_some());
    }

    #[tokio::test]
    async fn streams_are_accepted_in_open_order() {
        let (mut server, client) = session_pair();

        let first = client.open().await.expect("open failed");
        let second = client.open().await.expect("open failed");

        let accepted_first = server.accept().await.expect("accept failed");
        let accepted_second = server.accept().await.expect("accept failed");
        assert_eq!(accepted_first.id(), first.id());
        assert_eq!(accepted_second.id(), second.id());
    }

    #[tokio::test]
    async fn half_close_still_allows_replies() {
        let (mut server, client) = session_pair();

        let mut outbound = client.open().await.expect("open failed");
        outbound.write_all(b"request").await.expect("write failed");
        outbound.shutdown().await.expect("shutdown failed");

        let mut inbound = server.accept().await.expect("accept failed");
        let mut request = Vec::new();
        inbound
            .read_to_end(&mut request)
            .await
            .expect("read failed");
        assert_eq!(request, b"request");

        // The read side of the closed stream still works.
        inbound.write_all(b"reply").await.expect("write failed");
        inbound.shutdown().await.expect("shutdown failed");
        let mut reply = Vec::new();
        outbound.read_to_end(&mut reply).await.expect("read failed");
        assert_eq!(reply, b"reply");
    }

    #[tokio::test]
    async fn transfers_larger_than_the_window() {
        let (mut server, client) = session_pair();

        let payload: Vec<u8> = (0..(WINDOW_FRAMES * MAX_DATA_LEN * 4))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let mut outbound = client.open().await.expect("open failed");
        let writer = tokio::spawn(async move {
            outbound.write_all(&payload).await.expect("write failed");
            outbound.shutdown().await.expect("shutdown failed");
        });

        let mut inbound = server.accept().await.expect("accept failed");
        let mut received = Vec::new();
        inbound
            .read_to_end(&mut received)
            .await
            .expect("read failed");
        writer.await.expect("writer panicked");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn stalled_stream_does_not_block_others() {
        let (mut server, client) = session_pair();

        // Saturate the first stream's window without reading it.
        let mut stalled = client.open().await.expect("open failed");
        let _stalled_peer = server.accept().await.expect("accept failed");
        let filler = vec![0u8; WINDOW_FRAMES * MAX_DATA_LEN];
        let stall_writer = tokio::spawn(async move {
            // The filler spends every frame of window credit; the next write
            // blocks until the (never-reading) peer grants more.
            let _ = stalled.write_all(&filler).await;
            let _ = stalled.write_all(b"blocked").await;
            stalled
        });

        // A second stream still makes progress.
        let mut lively = client.open().await.expect("open failed");
        lively.write_all(b"still alive").await.expect("write failed");
        let mut inbound = server.accept().await.expect("accept failed");
        let mut buf = [0u8; 11];
        inbound.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"still alive");

        assert!(!stall_writer.is_finished());
        stall_writer.abort();
    }

    #[tokio::test]
    async fn shutdown_fails_outstanding_streams() {
        let (mut server, client) = session_pair();

        let mut outbound = client.open().await.expect("open failed");
        let _inbound = server.accept().await.expect("accept failed");

        client.control().shutdown().await;

        let mut buf = [0u8; 1];
        assert!(outbound.read_exact(&mut buf).await.is_err());
        assert!(client.open().await.is_err());
    }

    #[tokio::test]
    async fn peer_pipe_loss_ends_accept() {
        let (server, mut client) = session_pair();
        drop(server);
        // The dropped end tears the pipe down; accept drains to None.
        assert!(client.accept().await.is_none());
    }

    #[tokio::test]
    async fn data_written_before_close_is_delivered() {
        let (mut server, client) = session_pair();

        let mut outbound = client.open().await.expect("open failed");
        for chunk in 0u8..10 {
            outbound
                .write_all(&[chunk; 128])
                .await
                .expect("write failed");
        }
        outbound.shutdown().await.expect("shutdown failed");

        let mut inbound = server.accept().await.expect("accept failed");
        let mut received = Vec::new();
        inbound
            .read_to_end(&mut received)
            .await
            .expect("read failed");
        assert_eq!(received.len(), 10 * 128);
    }
}
