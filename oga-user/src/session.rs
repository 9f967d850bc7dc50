//! Session agent core logic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use oga_ipc::{
    BusError, ClientAgentLink, Frame, InboundHandler, MessageKind, Module, ModuleDispatch,
    Operations, Popup,
};

use crate::config::SessionConfig;

/// Module on the service side that pop-up acknowledgements go to.
const POPUP_MODULE: &str = "opengnsys";

/// Why [`UserSession::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Asked to stop through the stop handle.
    Stopped,
    /// The service closed the bus or sent something malformed.
    ServiceLost,
    /// The service was never reachable.
    NotConnected,
}

// ── UserSession ──────────────────────────────────────────────────

/// One logged-in user's agent.
pub struct UserSession {
    link: ClientAgentLink,
    dispatch: ModuleDispatch,
    operations: Arc<dyn Operations>,
    config: SessionConfig,
    username: String,
    language: String,
    running: Arc<AtomicBool>,
}

impl UserSession {
    pub fn new(
        link: ClientAgentLink,
        operations: Arc<dyn Operations>,
        config: SessionConfig,
        username: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            link,
            dispatch: ModuleDispatch::new(),
            operations,
            config,
            username: username.into(),
            language: language.into(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a session-side module; `MESSAGE` notifications are routed to it.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), BusError> {
        self.dispatch.register(module)
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until stopped or until the service goes away.
    ///
    /// Modules are activated and the login announced first; on the way out
    /// the logout is announced and modules are deactivated in reverse.
    pub async fn run(&self) -> SessionEnd {
        self.running.store(true, Ordering::SeqCst);

        self.dispatch.activate_all().await;
        if !self.link.is_connected() {
            warn!("agent service is not reachable; continuing without it");
        }
        if let Err(e) = self.link.send_login(&self.username, &self.language).await {
            warn!("could not announce login: {e}");
        }

        let end = loop {
            let next = tokio::select! {
                frame = self.link.next_inbound_message() => frame,
                _ = Self::wait_for_stop(&self.running) => break SessionEnd::Stopped,
            };
            match next {
                Some(frame) => self.handle(frame).await,
                None if self.link.is_connected() => {
                    warn!("lost connection with service, closing session agent");
                    break SessionEnd::ServiceLost;
                }
                None => break SessionEnd::NotConnected,
            }
        };

        if end == SessionEnd::Stopped {
            if let Err(e) = self.link.send_logout(&self.username).await {
                warn!("could not announce logout: {e}");
            }
        }
        self.link.stop();
        self.dispatch.deactivate_all().await;
        self.running.store(false, Ordering::SeqCst);
        info!("session agent for {} finished: {end:?}", self.username);
        end
    }

    async fn handle(&self, frame: Frame) {
        let kind = frame.kind();
        debug!("notification {kind} ({} bytes)", frame.len());
        match kind {
            MessageKind::Logoff => {
                info!("service requested logoff");
                if let Err(e) = self.operations.logoff() {
                    error!("logoff failed: {e}");
                }
            }
            MessageKind::Message => self.dispatch.on_frame(frame).await,
            MessageKind::Popup => self.popup(&frame).await,
            MessageKind::Script => self.script(&frame),
            other => debug!("ignoring {other}"),
        }
    }

    /// Pop-ups are shown by the desktop shell; here they are logged and
    /// acknowledged so the service can report them done.
    async fn popup(&self, frame: &Frame) {
        let popup = match Popup::decode(frame.payload()) {
            Ok(popup) => popup,
            Err(e) => {
                warn!("malformed popup: {e}");
                return;
            }
        };
        info!("popup \"{}\": {}", popup.title, popup.message);
        let ack = json!({ "title": popup.title });
        if let Err(e) = self
            .link
            .send_module_message(POPUP_MODULE, "popup_done", ack)
            .await
        {
            warn!("could not acknowledge popup: {e}");
        }
    }

    fn script(&self, frame: &Frame) {
        if !self.config.run_scripts {
            warn!("script execution disabled, dropping {} bytes", frame.len());
            return;
        }
        let script = String::from_utf8_lossy(frame.payload()).into_owned();
        tokio::spawn(run_script(script));
    }

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Run `script` through the platform shell and log the outcome.
async fn run_script(script: String) {
    debug!("executing script: {script}");
    let mut command = if cfg!(windows) {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(&script);
        c
    } else {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(&script);
        c
    };
    match command.output().await {
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if output.status.success() {
                info!("script finished");
            } else {
                warn!("script exited with {}: {}", output.status, stderr.trim());
            }
        }
        Err(e) => error!("cannot execute script: {e}"),
    }
}

// ── Tests ────────────────────────────────────────────────────────
