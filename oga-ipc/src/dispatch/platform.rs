//! What modules need from the machine and from the management server.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ModuleError;

/// Outbound reports to the remote management server.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, endpoint: &str, payload: Value) -> Result<(), ModuleError>;
}

/// Host facts and session control.
pub trait Operations: Send + Sync + 'static {
    fn os_type(&self) -> String;
    fn os_version(&self) -> String;
    /// Login name of the interactive user, if any.
    fn current_user(&self) -> Option<String>;
    /// Two-letter language of the session, if known.
    fn session_language(&self) -> Option<String>;
    /// End the interactive session.
    fn logoff(&self) -> Result<(), ModuleError>;
}

/// Writes every report to the log instead of sending it anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, endpoint: &str, payload: Value) -> Result<(), ModuleError> {
        info!("notify {endpoint}: {payload}");
        Ok(())
    }
}

/// Reads host facts from the process environment. `logoff` only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOperations;

impl Operations for LocalOperations {
    fn os_type(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn os_version(&self) -> String {
        std::env::var("OGA_OS_VERSION").unwrap_or_else(|_| std::env::consts::ARCH.to_string())
    }

    fn current_user(&self) -> Option<String> {
        ["USER", "USERNAME", "LOGNAME"]
            .iter()
            .find_map(|var| std::env::var(var).ok())
            .filter(|user| !user.is_empty())
    }

    fn session_language(&self) -> Option<String> {
        let lang = std::env::var("LANG").ok()?;
        language_code(&lang)
    }

    fn logoff(&self) -> Result<(), ModuleError> {
        warn!("session logoff requested; no session manager is wired in");
        Ok(())
    }
}

/// `es_ES.UTF-8` → `es`. `C` and `POSIX` carry no language.
fn language_code(locale: &str) -> Option<String> {
    let code: String = locale
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match code.as_str() {
        "" | "c" | "posix" => None,
        _ => Some(code),
    }
}
