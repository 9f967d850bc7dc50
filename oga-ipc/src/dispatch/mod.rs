//! Named modules and the dispatcher that routes bus traffic to them.
//!
//! Lifecycle of one registered module:
//!
//! ```text
//!  Registered ──activate ok──► Active ──deactivate──► Deactivated
//!       │
//!       └──activate err──► Failed   (never retried, never deactivated)
//! ```

pub mod opengnsys;
pub mod platform;

pub use opengnsys::SessionReporter;
pub use platform::{LocalOperations, LogNotifier, Notifier, Operations};

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{BusError, ModuleError};
use crate::frame::Frame;
use crate::message::{LoginRequest, MessageKind, ModuleMessage};
use crate::network::InboundHandler;

// ── Module ───────────────────────────────────────────────────────

/// A named handler living behind the bus.
///
/// Methods take `&self`; modules that keep state use interior mutability.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Routing key, matched exactly.
    fn name(&self) -> &str;

    async fn activate(&self) -> Result<(), ModuleError>;

    async fn deactivate(&self) -> Result<(), ModuleError>;

    /// Handle one `message` addressed to this module.
    async fn process(&self, message: &str, data: Value) -> Result<(), ModuleError>;

    /// A user session logged in.
    async fn on_login(&self, _login: &LoginRequest) -> Result<(), ModuleError> {
        Ok(())
    }

    /// A user session logged out.
    async fn on_logout(&self, _username: &str) -> Result<(), ModuleError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Registered,
    Active,
    Failed,
    Deactivated,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
            Self::Deactivated => write!(f, "deactivated"),
        }
    }
}

// ── ModuleDispatch ───────────────────────────────────────────────

struct Entry {
    module: Arc<dyn Module>,
    state: ModuleState,
}

/// Owns the module registry. Registration order is activation order.
///
/// The registry lock is never held across a module call: handlers are
/// cloned out first, so a slow module cannot block lookups.
#[derive(Default)]
pub struct ModuleDispatch {
    entries: RwLock<Vec<Entry>>,
}

impl std::fmt::Debug for ModuleDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map()
            .entries(entries.iter().map(|e| (e.module.name().to_string(), e.state)))
            .finish()
    }
}

impl ModuleDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), BusError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let name = module.name();
        if entries.iter().any(|e| e.module.name() == name) {
            return Err(BusError::DuplicateModule(name.to_string()));
        }
        debug!("registered module {name}");
        entries.push(Entry {
            module,
            state: ModuleState::Registered,
        });
        Ok(())
    }

    /// Activate every registered module in registration order.
    ///
    /// A module whose activation fails is dropped from the active set for
    /// good. Returns the failures; the remaining modules are active either
    /// way.
    pub async fn activate_all(&self) -> Vec<BusError> {
        let pending = self.modules_in(ModuleState::Registered);
        let mut failures = Vec::new();
        for module in pending {
            let name = module.name().to_string();
            let outcome = contained(&name, "activate", module.activate()).await;
            match outcome {
                Ok(()) => {
                    info!("module {name} activated");
                    self.set_state(&module, ModuleState::Active);
                }
                Err(source) => {
                    error!("module {name} failed to activate: {source}");
                    self.set_state(&module, ModuleState::Failed);
                    failures.push(BusError::Module {
                        module: name,
                        source,
                    });
                }
            }
        }
        failures
    }

    /// Deactivate active modules in reverse activation order.
    ///
    /// One module failing does not stop the rest.
    pub async fn deactivate_all(&self) -> Vec<BusError> {
        let mut active = self.modules_in(ModuleState::Active);
        active.reverse();
        let mut failures = Vec::new();
        for module in active {
            let name = module.name().to_string();
            self.set_state(&module, ModuleState::Deactivated);
            match contained(&name, "deactivate", module.deactivate()).await {
                Ok(()) => info!("module {name} deactivated"),
                Err(source) => {
                    error!("module {name} failed to deactivate: {source}");
                    failures.push(BusError::Module {
                        module: name,
                        source,
                    });
                }
            }
        }
        failures
    }

    /// Route `message` to the active module called `module`.
    pub async fn dispatch(&self, module: &str, message: &str, data: Value) -> Result<(), BusError> {
        let Some(target) = self.active(module) else {
            return Err(BusError::ModuleNotFound(module.to_string()));
        };
        debug!("dispatching {module}/{message}");
        contained(module, message, target.process(message, data))
            .await
            .map_err(|source| BusError::Module {
                module: module.to_string(),
                source,
            })
    }

    /// Tell every active module that a session logged in.
    pub async fn login(&self, login: &LoginRequest) {
        info!(
            "user {} logged in (language {:?})",
            login.username, login.language
        );
        for module in self.modules_in(ModuleState::Active) {
            let name = module.name().to_string();
            if let Err(e) = contained(&name, "on_login", module.on_login(login)).await {
                error!("module {name}: login hook failed: {e}");
            }
        }
    }

    /// Tell every active module that a session logged out.
    pub async fn logout(&self, username: &str) {
        info!("user {username} logged out");
        for module in self.modules_in(ModuleState::Active) {
            let name = module.name().to_string();
            if let Err(e) = contained(&name, "on_logout", module.on_logout(username)).await {
                error!("module {name}: logout hook failed: {e}");
            }
        }
    }

    /// Names of active modules, in activation order.
    pub fn active_modules(&self) -> Vec<String> {
        self.modules_in(ModuleState::Active)
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| e.state)
    }

    fn active(&self, name: &str) -> Option<Arc<dyn Module>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|e| e.state == ModuleState::Active && e.module.name() == name)
            .map(|e| Arc::clone(&e.module))
    }

    fn modules_in(&self, state: ModuleState) -> Vec<Arc<dyn Module>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| Arc::clone(&e.module))
            .collect()
    }

    fn set_state(&self, module: &Arc<dyn Module>, state: ModuleState) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|e| Arc::ptr_eq(&e.module, module)) {
            entry.state = state;
        }
    }
}

/// Bus-facing side: decode the payload and route by kind.
#[async_trait]
impl InboundHandler for ModuleDispatch {
    async fn on_frame(&self, frame: Frame) {
        let kind = frame.kind();
        match kind {
            MessageKind::ReqLogin => match LoginRequest::decode(frame.payload()) {
                Ok(login) => self.login(&login).await,
                Err(e) => warn!("malformed {kind}: {e}"),
            },
            MessageKind::ReqLogout => match std::str::from_utf8(frame.payload()) {
                Ok(username) => self.logout(username).await,
                Err(e) => warn!("malformed {kind}: {e}"),
            },
            MessageKind::ReqMessage | MessageKind::Message => {
                match ModuleMessage::decode(frame.payload()) {
                    Ok(msg) => {
                        if let Err(e) = self.dispatch(&msg.module, &msg.message, msg.data).await {
                            error!("{kind} {}/{} not handled: {e}", msg.module, msg.message);
                        }
                    }
                    Err(e) => warn!("malformed {kind}: {e}"),
                }
            }
            MessageKind::Logoff | MessageKind::Popup | MessageKind::Script => {
                debug!("{kind} is not routed to modules, ignored");
            }
        }
    }
}

/// Await a module call, turning a panic into [`ModuleError::Panicked`].
async fn contained<F>(module: &str, call: &str, fut: F) -> Result<(), ModuleError>
where
    F: Future<Output = Result<(), ModuleError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            error!("module {module}: {call} panicked: {}", panic_message(&*panic));
            Err(ModuleError::Panicked)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string payload"
    }
}
