use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{FrameCodec, Role};
use crate::config::ConnectionConfig;
use crate::error::BusError;
use crate::frame::Frame;
use crate::network::wait_for_stop;

/// Identifies one accepted session for logging.
pub type SessionId = u64;

/// Receives every frame decoded on a connection.
///
/// Runs on that connection's read loop: while it is awaited, no further
/// frames are read from the same socket.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_frame(&self, frame: Frame);
}

#[async_trait]
impl<F> InboundHandler for F
where
    F: Fn(Frame) + Send + Sync + 'static,
{
    async fn on_frame(&self, frame: Frame) {
        self(frame)
    }
}

// ── FrameReader ──────────────────────────────────────────────────

/// Pulls frames off a decoded stream, waking every `poll_interval` to
/// look at the running flag.
pub struct FrameReader<St> {
    inner: St,
    poll_interval: Duration,
}

impl<St> FrameReader<St>
where
    St: Stream<Item = Result<Frame, BusError>> + Unpin,
{
    pub fn new(inner: St, poll_interval: Duration) -> Self {
        Self {
            inner,
            poll_interval,
        }
    }

    /// The next frame, or `None` once the connection should end: the
    /// flag was cleared, the peer closed, or the stream failed.
    pub async fn next_frame(&mut self, running: &AtomicBool) -> Option<Frame> {
        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.poll_interval, self.inner.next()).await {
                // No data yet.
                Err(_) => continue,
                Ok(Some(Ok(frame))) => return Some(frame),
                Ok(Some(Err(e))) => {
                    warn!("read failed: {e}");
                    return None;
                }
                Ok(None) => {
                    debug!("peer closed the connection");
                    return None;
                }
            }
        }
        None
    }
}

// ── Connection ───────────────────────────────────────────────────

/// One live socket with independent read and write loops.
///
/// The outbound queue and the running flag are the only state shared
/// between the two loops and the owner.
#[derive(Debug)]
pub struct Connection {
    id: SessionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Frame>,
    running: Arc<AtomicBool>,
    enqueue_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Split `stream` and start both loops.
    pub fn spawn<S>(
        id: SessionId,
        peer: Option<SocketAddr>,
        stream: S,
        role: Role,
        handler: Arc<dyn InboundHandler>,
        config: &ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = Framed::new(stream, FrameCodec::new(role)).split();
        let (tx, rx) = mpsc::channel(config.queue_capacity());
        let running = Arc::new(AtomicBool::new(true));
        let poll = config.poll_interval();

        let reader = tokio::spawn(read_loop(
            id,
            FrameReader::new(stream, poll),
            handler,
            Arc::clone(&running),
        ));
        let writer = tokio::spawn(write_loop(id, sink, rx, Arc::clone(&running), poll));

        Self {
            id,
            peer,
            outbound: tx,
            running,
            enqueue_timeout: config.enqueue_timeout(),
            reader,
            writer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask both loops to finish; they notice within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Queue a frame, waiting up to the enqueue timeout for room.
    pub async fn send(&self, frame: Frame) -> Result<(), BusError> {
        if !self.is_alive() {
            return Err(BusError::Stopped);
        }
        match self.outbound.send_timeout(frame, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(frame)) => {
                warn!(
                    "session {}: queue full, dropping {}",
                    self.id,
                    frame.kind()
                );
                Err(BusError::QueueFull(self.enqueue_timeout))
            }
            Err(SendTimeoutError::Closed(_)) => Err(BusError::ChannelClosed),
        }
    }

    /// Queue a frame without waiting; a full queue drops it.
    pub fn try_send(&self, frame: Frame) -> Result<(), BusError> {
        if !self.is_alive() {
            return Err(BusError::Stopped);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                warn!(
                    "session {}: queue full, dropping {}",
                    self.id,
                    frame.kind()
                );
                Err(BusError::QueueFull(Duration::ZERO))
            }
            Err(TrySendError::Closed(_)) => Err(BusError::ChannelClosed),
        }
    }

    /// Wait for both loops to finish. Call [`stop`](Self::stop) first
    /// unless the peer is expected to close.
    pub async fn join(self) {
        for (what, handle) in [("reader", self.reader), ("writer", self.writer)] {
            if let Err(e) = handle.await {
                warn!("session {}: {what} task failed: {e}", self.id);
            }
        }
        debug!("session {} finished", self.id);
    }
}

async fn read_loop<St>(
    id: SessionId,
    mut reader: FrameReader<St>,
    handler: Arc<dyn InboundHandler>,
    running: Arc<AtomicBool>,
) where
    St: Stream<Item = Result<Frame, BusError>> + Unpin,
{
    while let Some(frame) = reader.next_frame(&running).await {
        debug!("session {id}: received {} ({} bytes)", frame.kind(), frame.len());
        handler.on_frame(frame).await;
    }
    running.store(false, Ordering::SeqCst);
    debug!("session {id}: read loop stopped");
}

async fn write_loop<Si>(
    id: SessionId,
    mut sink: Si,
    mut rx: mpsc::Receiver<Frame>,
    running: Arc<AtomicBool>,
    poll: Duration,
) where
    Si: Sink<Frame, Error = BusError> + Unpin,
{
    while running.load(Ordering::SeqCst) {
        let frame = match tokio::time::timeout(poll, rx.recv()).await {
            Err(_) => continue,
            Ok(Some(frame)) => frame,
            // Owner dropped the connection handle.
            Ok(None) => break,
        };

        let kind = frame.kind();
        let sent = tokio::select! {
            result = sink.send(frame) => result,
            _ = wait_for_stop(&running, poll) => break,
        };
        match sent {
            Ok(()) => debug!("session {id}: sent {kind}"),
            Err(e) => {
                debug!("session {id}: write failed, connection no longer available: {e}");
                break;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    // A hung peer must not keep the flush pending forever.
    let _ = tokio::time::timeout(poll, sink.close()).await;
    debug!("session {id}: write loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            queue_capacity: 4,
            poll_interval_ms: 20,
            enqueue_timeout_ms: 50,
        }
    }

    fn recording_handler() -> (Arc<dyn InboundHandler>, Arc<Mutex<Vec<Frame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn InboundHandler> =
            Arc::new(move |frame: Frame| sink.lock().unwrap().push(frame));
        (handler, seen)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn server_role_reads_requests_and_writes_notifications() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (handler, seen) = recording_handler();
        let conn = Connection::spawn(1, None, local, Role::Server, handler, &fast_config());

        remote.write_all(&[0xE5, 0x08, 0x00]).await.unwrap();
        remote.write_all(b"alice,en").await.unwrap();
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen[0].kind(), MessageKind::ReqLogin);
            assert_eq!(seen[0].payload(), b"alice,en");
        }

        conn.send(Frame::empty(MessageKind::Logoff)).await.unwrap();
        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x4F, 0x47, 0x41, 0x00, 0xA1, 0x00, 0x00]);

        conn.stop();
        conn.join().await;
    }

    #[tokio::test]
    async fn outbound_frames_keep_queue_order() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (handler, _) = recording_handler();
        let conn = Connection::spawn(2, None, local, Role::Client, handler, &fast_config());

        for i in 0u8..10 {
            conn.send(Frame::new(MessageKind::ReqLogout, vec![i]).unwrap())
                .await
                .unwrap();
        }
        let mut buf = [0u8; 40];
        remote.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(4).enumerate() {
            assert_eq!(chunk, [0xF6, 0x01, 0x00, i as u8]);
        }

        conn.stop();
        conn.join().await;
    }

    #[tokio::test]
    async fn peer_close_stops_connection() {
        let (local, remote) = tokio::io::duplex(64);
        let (handler, _) = recording_handler();
        let conn = Connection::spawn(3, None, local, Role::Server, handler, &fast_config());
        assert!(conn.is_alive());

        drop(remote);
        wait_until(|| !conn.is_alive()).await;
        assert!(matches!(
            conn.try_send(Frame::empty(MessageKind::Logoff)),
            Err(BusError::Stopped)
        ));
        conn.join().await;
    }

    #[tokio::test]
    async fn stop_ends_both_loops_promptly() {
        let (local, _remote) = tokio::io::duplex(64);
        let (handler, _) = recording_handler();
        let conn = Connection::spawn(4, None, local, Role::Server, handler, &fast_config());

        conn.stop();
        tokio::time::timeout(Duration::from_secs(2), conn.join())
            .await
            .expect("loops did not observe stop");
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        // A tiny pipe nobody reads from: the writer blocks on the socket and
        // the queue fills up behind it.
        let (local, _remote) = tokio::io::duplex(8);
        let (handler, _) = recording_handler();
        let conn = Connection::spawn(5, None, local, Role::Server, handler, &fast_config());

        let big = Frame::new(MessageKind::Script, vec![0u8; 1024]).unwrap();
        let mut saw_full = false;
        for _ in 0..16 {
            if let Err(BusError::QueueFull(_)) = conn.send(big.clone()).await {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);

        conn.stop();
        conn.join().await;
    }
}
