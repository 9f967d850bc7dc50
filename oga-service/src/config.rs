//! Configuration for the agent service.

use std::path::Path;

use serde::{Deserialize, Serialize};

use oga_ipc::{BusConfig, ConnectionConfig, ServerConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Where the session bus listens.
    pub bus: BusConfig,
    /// Per-session queueing and shutdown responsiveness.
    pub connection: ConnectionConfig,
    /// Which bundled modules to load.
    pub modules: ModulesConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Bundled module switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Load the `opengnsys` session reporter.
    pub opengnsys: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive, e.g. `"info"` or `"oga_ipc=debug"`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ModulesConfig {
    fn default() -> Self {
        Self { opengnsys: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServiceConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bus: self.bus.clone(),
            connection: self.connection.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
