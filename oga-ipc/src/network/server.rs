//! Service-side multiplexer.
//!
//! `ServerMultiplexer` binds the loopback listener and owns the session
//! registry. Only its accept task touches the registry: accepting appends,
//! housekeeping prunes, and every other request (broadcast, session count,
//! shutdown) reaches it through a control channel held by
//! [`ServerHandle`]s.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::Role;
use crate::config::{ConnectionConfig, ServerConfig};
use crate::error::BusError;
use crate::frame::Frame;
use crate::message::{Direction, MessageKind, ModuleMessage, Popup};
use crate::network::connection::{Connection, InboundHandler, SessionId};

/// Pending control requests the accept task may lag behind by.
const CONTROL_CAPACITY: usize = 256;

/// Pause after a failed `accept()` so a persistent error (out of file
/// descriptors) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Control {
    Broadcast(Frame),
    SessionCount(oneshot::Sender<usize>),
    Shutdown,
}

// ── ServerHandle ─────────────────────────────────────────────────

/// Cheap, cloneable sender side of a running multiplexer.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    control: mpsc::Sender<Control>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Broadcast(frame) => write!(f, "Broadcast({})", frame.kind()),
            Control::SessionCount(_) => write!(f, "SessionCount"),
            Control::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl ServerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a notification for every live session.
    ///
    /// Best effort: sessions that are gone are skipped and there is no
    /// delivery confirmation. Only server → client kinds are accepted.
    pub fn broadcast(&self, kind: MessageKind, payload: impl Into<Bytes>) -> Result<(), BusError> {
        if kind.direction() != Direction::ServerToClient {
            return Err(BusError::UnknownKind(kind as u8));
        }
        let frame = Frame::new(kind, payload)?;
        if !self.is_running() {
            return Err(BusError::Stopped);
        }
        match self.control.try_send(Control::Broadcast(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("bus control queue full, dropping {kind} broadcast");
                Err(BusError::QueueFull(Duration::ZERO))
            }
            Err(TrySendError::Closed(_)) => Err(BusError::Stopped),
        }
    }

    /// Ask every session to log its user off.
    pub fn send_logoff(&self) -> Result<(), BusError> {
        self.broadcast(MessageKind::Logoff, Bytes::new())
    }

    /// Deliver a module message to the session agents' modules.
    pub fn send_client_message(
        &self,
        module: &str,
        message: &str,
        data: serde_json::Value,
    ) -> Result<(), BusError> {
        let payload = ModuleMessage::new(module, message, data).encode()?;
        self.broadcast(MessageKind::Message, payload)
    }

    pub fn send_popup(&self, title: &str, message: &str) -> Result<(), BusError> {
        let payload = Popup {
            title: title.to_string(),
            message: message.to_string(),
        }
        .encode()?;
        self.broadcast(MessageKind::Popup, payload)
    }

    pub fn send_script(&self, script: impl Into<Bytes>) -> Result<(), BusError> {
        self.broadcast(MessageKind::Script, script)
    }

    /// Number of live sessions after housekeeping. `0` once stopped.
    pub async fn session_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::SessionCount(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

// ── SessionBus ───────────────────────────────────────────────────

/// A route to the sessions for code built before the bus is bound.
///
/// Clones share one slot. The owner of the multiplexer attaches its
/// handle once the listener is up and detaches it before stopping; in
/// between, every send goes to [`ServerHandle`]. Outside that window
/// sends fail with [`BusError::NotConnected`].
#[derive(Debug, Clone, Default)]
pub struct SessionBus {
    slot: Arc<RwLock<Option<ServerHandle>>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, handle: ServerHandle) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn detach(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ServerHandle::is_running)
    }

    /// The attached handle, or `NotConnected` while there is none.
    pub fn handle(&self) -> Result<ServerHandle, BusError> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BusError::NotConnected)
    }

    pub fn send_logoff(&self) -> Result<(), BusError> {
        self.handle()?.send_logoff()
    }

    pub fn send_client_message(
        &self,
        module: &str,
        message: &str,
        data: serde_json::Value,
    ) -> Result<(), BusError> {
        self.handle()?.send_client_message(module, message, data)
    }

    pub fn send_popup(&self, title: &str, message: &str) -> Result<(), BusError> {
        self.handle()?.send_popup(title, message)
    }

    pub fn send_script(&self, script: impl Into<Bytes>) -> Result<(), BusError> {
        self.handle()?.send_script(script)
    }
}

// ── ServerMultiplexer ────────────────────────────────────────────

#[derive(Debug)]
pub struct ServerMultiplexer {
    handle: ServerHandle,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ServerMultiplexer {
    /// Bind and start accepting. A bind failure is returned to the caller,
    /// which cannot run without its port.
    pub async fn start(
        config: ServerConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, BusError> {
        let addr = config.bus.resolve().await?;
        if !addr.ip().is_loopback() {
            warn!("bus bound to non-loopback address {addr}; remote hosts can connect");
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("bus listening on {local_addr}");

        let running = Arc::new(AtomicBool::new(true));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        let accept = AcceptLoop {
            listener,
            sessions: Vec::new(),
            next_id: 1,
            handler,
            config: config.connection,
            running: Arc::clone(&running),
            control: control_rx,
        };
        let accept_task = tokio::spawn(accept.run());

        Ok(Self {
            handle: ServerHandle {
                control: control_tx,
                running,
                local_addr,
            },
            local_addr,
            accept_task,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broadcast(&self, kind: MessageKind, payload: impl Into<Bytes>) -> Result<(), BusError> {
        self.handle.broadcast(kind, payload)
    }

    /// Stop every session, close the listener and wait for all
    /// connection tasks to finish.
    pub async fn stop(self) {
        info!("stopping bus");
        self.handle.running.store(false, Ordering::SeqCst);
        // The accept task is parked in `select!`; this wakes it.
        let _ = self.handle.control.send(Control::Shutdown).await;
        if let Err(e) = self.accept_task.await {
            warn!("accept task failed: {e}");
        }
    }
}

// ── Accept loop ──────────────────────────────────────────────────

struct AcceptLoop {
    listener: TcpListener,
    sessions: Vec<Connection>,
    next_id: SessionId,
    handler: Arc<dyn InboundHandler>,
    config: ConnectionConfig,
    running: Arc<AtomicBool>,
    control: mpsc::Receiver<Control>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }
                        self.prune();
                        self.register(stream, peer);
                    }
                    Err(e) => back_off(&e).await,
                },
                control = self.control.recv() => match control {
                    Some(Control::Broadcast(frame)) => self.broadcast(frame),
                    Some(Control::SessionCount(reply)) => {
                        self.prune();
                        let _ = reply.send(self.sessions.len());
                    }
                    Some(Control::Shutdown) | None => break,
                },
            }
        }
        self.shutdown().await;
    }

    /// Housekeeping: forget sessions whose loops have ended.
    fn prune(&mut self) {
        let before = self.sessions.len();
        self.sessions.retain(Connection::is_alive);
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!("pruned {removed} finished sessions, {} live", self.sessions.len());
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("session {id}: could not set TCP_NODELAY: {e}");
        }
        info!("session {id}: connection from {peer}");

        let conn = Connection::spawn(
            id,
            Some(peer),
            stream,
            Role::Server,
            Arc::clone(&self.handler),
            &self.config,
        );
        self.sessions.push(conn);
    }

    /// Fan out without waiting on any one session: a peer that stopped
    /// reading loses its own frames once its queue is full.
    fn broadcast(&self, frame: Frame) {
        debug!(
            "broadcasting {} ({} bytes) to {} sessions",
            frame.kind(),
            frame.len(),
            self.sessions.len()
        );
        for conn in self.sessions.iter().filter(|c| c.is_alive()) {
            if let Err(e) = conn.try_send(frame.clone()) {
                debug!("session {}: {} not delivered: {e}", conn.id(), frame.kind());
            }
        }
    }

    async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        for conn in &self.sessions {
            conn.stop();
        }
        drop(self.listener);
        for conn in self.sessions {
            conn.join().await;
        }
        info!("bus stopped");
    }
}

async fn back_off(e: &std::io::Error) {
    warn!("accept failed: {e}");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, ClientConfig};
    use crate::network::ClientAgentLink;
    use crate::retry::RetryPolicy;

    fn fast() -> ConnectionConfig {
        ConnectionConfig {
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn loopback_server() -> ServerMultiplexer {
        let config = ServerConfig {
            bus: BusConfig {
                host: "127.0.0.1".into(),
                port: 0,
            },
            connection: fast(),
        };
        let handler: Arc<dyn InboundHandler> = Arc::new(|_: Frame| {});
        ServerMultiplexer::start(config, handler).await.unwrap()
    }

    #[tokio::test]
    async fn session_bus_sends_only_while_attached() {
        let bus = SessionBus::new();
        assert!(!bus.is_attached());
        assert!(matches!(bus.send_logoff(), Err(BusError::NotConnected)));

        let server = loopback_server().await;
        let owner = bus.clone();
        owner.attach(server.handle());
        assert!(bus.is_attached());

        let mut client = ClientConfig {
            connection: fast(),
            retry: RetryPolicy::once(),
            ..Default::default()
        };
        client.bus.port = server.local_addr().port();
        let link = ClientAgentLink::connect(&client).await;
        for _ in 0..500 {
            if server.handle().session_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        bus.send_popup("Aviso", "Hola").unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), link.next_inbound_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind(), MessageKind::Popup);
        assert_eq!(Popup::decode(frame.payload()).unwrap().title, "Aviso");

        bus.detach();
        assert!(matches!(
            bus.send_script(&b"true"[..]),
            Err(BusError::NotConnected)
        ));

        link.stop();
        link.join().await;
        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn accept_failure_pauses_before_retrying() {
        let started = tokio::time::Instant::now();
        back_off(&std::io::Error::other("too many open files")).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn stopped_bus_refuses_sends() {
        let bus = SessionBus::new();
        let server = loopback_server().await;
        bus.attach(server.handle());
        server.stop().await;

        assert!(!bus.is_attached());
        assert!(matches!(bus.send_logoff(), Err(BusError::Stopped)));
    }
}
