//! Session-side link to the service bus.
//!
//! Requests go straight to the socket from the caller's task; notifications
//! are read by a background loop into a bounded inbox that the owner drains
//! with [`ClientAgentLink::next_inbound_message`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::config::ClientConfig;
use crate::error::BusError;
use crate::frame::Frame;
use crate::message::{LoginRequest, MessageKind, ModuleMessage};
use crate::network::connection::FrameReader;
use crate::network::wait_for_stop;

type RequestSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

struct LinkInner {
    peer: Option<SocketAddr>,
    writer: Mutex<RequestSink>,
    inbox: Mutex<mpsc::Receiver<Frame>>,
    receiver: JoinHandle<()>,
}

/// One outbound connection from a user session to the service.
///
/// A link that could not connect stays usable: sends are no-ops and the
/// inbox is immediately exhausted. The owner decides whether to carry on
/// without the bus.
pub struct ClientAgentLink {
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    inner: Option<LinkInner>,
}

impl std::fmt::Debug for ClientAgentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAgentLink")
            .field("connected", &self.is_connected())
            .field("running", &self.is_running())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl ClientAgentLink {
    /// Connect to the service, retrying per `config.retry`.
    pub async fn connect(config: &ClientConfig) -> Self {
        let addr = match config.bus.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("cannot connect to service: {e}");
                return Self::disconnected(config);
            }
        };

        let connected = config
            .retry
            .retry(|attempt| async move {
                debug!("connecting to service at {addr} (attempt {attempt})");
                TcpStream::connect(addr).await
            })
            .await;

        match connected {
            Ok(stream) => Self::from_stream(stream, config),
            Err(e) => {
                warn!("service at {addr} is not reachable: {e}");
                Self::disconnected(config)
            }
        }
    }

    /// Wrap an already connected socket.
    pub fn from_stream(stream: TcpStream, config: &ClientConfig) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {e}");
        }

        let poll_interval = config.connection.poll_interval();
        let (sink, stream) = Framed::new(stream, FrameCodec::client()).split();
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));

        let receiver = tokio::spawn(receive_loop(
            FrameReader::new(stream, poll_interval),
            inbox_tx,
            Arc::clone(&running),
            poll_interval,
        ));

        if let Some(peer) = peer {
            info!("connected to service at {peer}");
        }

        Self {
            running,
            poll_interval,
            inner: Some(LinkInner {
                peer,
                writer: Mutex::new(sink),
                inbox: Mutex::new(inbox_rx),
                receiver,
            }),
        }
    }

    fn disconnected(config: &ClientConfig) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            poll_interval: config.connection.poll_interval(),
            inner: None,
        }
    }

    /// Whether the link ever reached the service.
    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Connected and neither stopped nor lost.
    pub fn is_running(&self) -> bool {
        self.is_connected() && self.running.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|inner| inner.peer)
    }

    // ── Requests ─────────────────────────────────────────────────

    pub async fn send_login(&self, username: &str, language: &str) -> Result<(), BusError> {
        let payload = LoginRequest::new(username, language).encode();
        self.send_request(MessageKind::ReqLogin, payload).await
    }

    pub async fn send_logout(&self, username: &str) -> Result<(), BusError> {
        self.send_request(MessageKind::ReqLogout, username.as_bytes().to_vec())
            .await
    }

    /// Send `data` to the service module named `module`.
    pub async fn send_module_message(
        &self,
        module: &str,
        message: &str,
        data: serde_json::Value,
    ) -> Result<(), BusError> {
        let payload = ModuleMessage::new(module, message, data).encode()?;
        self.send_request(MessageKind::ReqMessage, payload).await
    }

    /// Write one request frame and wait until it is on the socket.
    async fn send_request(&self, kind: MessageKind, payload: Vec<u8>) -> Result<(), BusError> {
        let Some(inner) = &self.inner else {
            debug!("not connected, {kind} not sent");
            return Ok(());
        };

        let frame = Frame::new(kind, payload)?;
        debug!("sending {kind} ({} bytes)", frame.len());
        let mut writer = inner.writer.lock().await;
        let sent = match tokio::time::timeout(self.poll_interval, writer.send(frame)).await {
            Ok(sent) => sent,
            // A half-written frame cannot be recovered from.
            Err(_) => Err(BusError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "service stopped reading",
            ))),
        };
        if let Err(e) = sent {
            warn!("lost connection with service: {e}");
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    // ── Notifications ────────────────────────────────────────────

    /// The next notification from the service.
    ///
    /// `None` is the end-of-messages signal: the link was stopped, the
    /// service went away, or it sent something malformed.
    pub async fn next_inbound_message(&self) -> Option<Frame> {
        let inner = self.inner.as_ref()?;
        let mut inbox = inner.inbox.lock().await;
        loop {
            match tokio::time::timeout(self.poll_interval, inbox.recv()).await {
                Ok(frame) => return frame,
                Err(_) if !self.running.load(Ordering::SeqCst) => return None,
                Err(_) => continue,
            }
        }
    }

    /// Ask the receive loop to finish; it notices within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the receive loop, then close the socket.
    pub async fn join(self) {
        if let Some(inner) = self.inner {
            if let Err(e) = inner.receiver.await {
                warn!("receive task failed: {e}");
            }
        }
    }
}

async fn receive_loop<St>(
    mut reader: FrameReader<St>,
    inbox: mpsc::Sender<Frame>,
    running: Arc<AtomicBool>,
    poll: Duration,
) where
    St: Stream<Item = Result<Frame, BusError>> + Unpin,
{
    while let Some(frame) = reader.next_frame(&running).await {
        debug!("received {} ({} bytes)", frame.kind(), frame.len());
        let queued = tokio::select! {
            result = inbox.send(frame) => result.is_ok(),
            _ = wait_for_stop(&running, poll) => false,
        };
        if !queued {
            break;
        }
    }
    if running.swap(false, Ordering::SeqCst) {
        warn!("connection with service ended");
    }
    debug!("receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, ConnectionConfig};
    use crate::retry::RetryPolicy;
    use serde_json::json;

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(port: u16) -> ClientConfig {
        ClientConfig {
            bus: BusConfig {
                host: "127.0.0.1".into(),
                port,
            },
            connection: ConnectionConfig {
                poll_interval_ms: 20,
                ..Default::default()
            },
            inbox_capacity: 4,
            retry: RetryPolicy::new(2, Duration::from_millis(10)),
        }
    }

    #[tokio::test]
    async fn unreachable_service_degrades_to_noop() {
        let link = ClientAgentLink::connect(&config(unused_port().await)).await;
        assert!(!link.is_connected());
        assert!(!link.is_running());

        link.send_login("alice", "en").await.unwrap();
        link.send_logout("alice").await.unwrap();
        link.send_module_message("opengnsys", "ping", json!(null))
            .await
            .unwrap();
        assert!(link.next_inbound_message().await.is_none());
        link.join().await;
    }

    #[tokio::test]
    async fn requests_have_no_magic_and_notifications_are_queued() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = ClientAgentLink::connect(&config(port)).await;
        let (mut service, _) = listener.accept().await.unwrap();
        assert!(link.is_running());

        link.send_logout("bob").await.unwrap();
        let mut buf = [0u8; 6];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0xF6, 0x03, 0x00, b'b', b'o', b'b']);

        // Noise before the marker is skipped.
        service
            .write_all(&[0xFF, 0x4F, 0x47, 0x41, 0x00, 0xA1, 0x00, 0x00])
            .await
            .unwrap();
        let frame = link.next_inbound_message().await.unwrap();
        assert_eq!(frame.kind(), MessageKind::Logoff);

        // A request kind from the service is a protocol violation.
        service
            .write_all(&[0x4F, 0x47, 0x41, 0x00, 0xE5, 0x00, 0x00])
            .await
            .unwrap();
        assert!(link.next_inbound_message().await.is_none());
        assert!(!link.is_running());
        link.join().await;
    }

    #[tokio::test]
    async fn stop_ends_message_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = ClientAgentLink::connect(&config(port)).await;
        let _service = listener.accept().await.unwrap();

        link.stop();
        let next = tokio::time::timeout(Duration::from_secs(2), link.next_inbound_message())
            .await
            .expect("consumer did not observe stop");
        assert!(next.is_none());
        link.join().await;
    }

    #[tokio::test]
    async fn request_to_a_stalled_service_fails_instead_of_hanging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = ClientAgentLink::connect(&config(port)).await;
        // Accepted but never read.
        let _service = listener.accept().await.unwrap();

        let bulk = json!("x".repeat(60_000));
        let failed = tokio::time::timeout(Duration::from_secs(30), async {
            for _ in 0..2_000 {
                if link
                    .send_module_message("opengnsys", "bulk", bulk.clone())
                    .await
                    .is_err()
                {
                    return true;
                }
            }
            false
        })
        .await
        .expect("request write blocked");
        assert!(failed);
        assert!(!link.is_running());
        link.join().await;
    }
}
