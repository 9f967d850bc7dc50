//! Agent service core logic.
//!
//! Brings the modules up, serves the session bus until stopped, then
//! tears both down in reverse order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use oga_ipc::{
    BusError, LocalOperations, LogNotifier, Module, ModuleDispatch, ServerHandle,
    ServerMultiplexer, SessionBus, SessionReporter,
};

use crate::config::ServiceConfig;

// ── AgentService ─────────────────────────────────────────────────

/// The top-level service.
///
/// Owns the module registry and, while running, the bus multiplexer.
/// Modules reach the sessions through [`sessions`](Self::sessions), which
/// is attached for as long as the bus is up.
pub struct AgentService {
    config: ServiceConfig,
    dispatch: Arc<ModuleDispatch>,
    running: Arc<AtomicBool>,
    bus: watch::Sender<Option<ServerHandle>>,
    sessions: SessionBus,
    reporter: Option<Arc<SessionReporter>>,
}

impl AgentService {
    /// Create a service with the bundled modules the config enables.
    pub fn new(config: ServiceConfig) -> Result<Self, BusError> {
        let mut service = Self::bare(config);
        if service.config.modules.opengnsys {
            let reporter = Arc::new(SessionReporter::new(
                Arc::new(LogNotifier),
                Arc::new(LocalOperations),
                service.sessions.clone(),
            ));
            service.register(reporter.clone())?;
            service.reporter = Some(reporter);
        }
        Ok(service)
    }

    /// Create a service with no modules registered.
    pub fn bare(config: ServiceConfig) -> Self {
        Self {
            config,
            dispatch: Arc::new(ModuleDispatch::new()),
            running: Arc::new(AtomicBool::new(false)),
            bus: watch::Sender::new(None),
            sessions: SessionBus::new(),
            reporter: None,
        }
    }

    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), BusError> {
        self.dispatch.register(module)
    }

    pub fn dispatch(&self) -> &Arc<ModuleDispatch> {
        &self.dispatch
    }

    /// Route to the connected session agents, for modules built outside
    /// [`new`](Self::new).
    pub fn sessions(&self) -> &SessionBus {
        &self.sessions
    }

    /// The bundled `opengnsys` module, when the config enables it.
    pub fn reporter(&self) -> Option<&Arc<SessionReporter>> {
        self.reporter.as_ref()
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Resolves with the bus handle once the listener is up. Pends until
    /// [`run`](Self::run) has bound the bus.
    pub async fn bus_handle(&self) -> Option<ServerHandle> {
        let mut rx = self.bus.subscribe();
        let handle = rx.wait_for(Option::is_some).await.ok()?;
        (*handle).clone()
    }

    /// Run the service until stopped.
    ///
    /// 1. Activates every registered module.
    /// 2. Binds the bus; a bind failure deactivates the modules again and
    ///    is returned.
    /// 3. Serves sessions until `running` becomes `false`.
    /// 4. Stops the bus, then deactivates modules in reverse order.
    pub async fn run(&self) -> Result<(), BusError> {
        self.running.store(true, Ordering::SeqCst);

        let failed = self.dispatch.activate_all().await.len();
        let active = self.dispatch.active_modules();
        info!("modules active: {active:?} ({failed} failed to activate)");

        let server =
            match ServerMultiplexer::start(self.config.to_server_config(), self.dispatch.clone())
                .await
            {
                Ok(server) => server,
                Err(e) => {
                    warn!("cannot start session bus: {e}");
                    self.running.store(false, Ordering::SeqCst);
                    self.dispatch.deactivate_all().await;
                    return Err(e);
                }
            };
        self.sessions.attach(server.handle());
        self.bus.send_replace(Some(server.handle()));

        Self::wait_for_stop(&self.running).await;

        self.bus.send_replace(None);
        self.sessions.detach();
        server.stop().await;
        self.dispatch.deactivate_all().await;
        info!("agent service stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The address the bus would bind, for the startup banner.
    pub async fn bus_addr(&self) -> Result<SocketAddr, BusError> {
        self.config.bus.resolve().await
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

// ── Tests ────────────────────────────────────────────────────────
