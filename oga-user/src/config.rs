//! Configuration for the session agent.

use std::path::Path;

use serde::{Deserialize, Serialize};

use oga_ipc::ClientConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// How to reach the agent service.
    pub client: ClientConfig,
    /// Session behaviour.
    pub session: SessionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Execute `SCRIPT` notifications. When off they are logged and dropped.
    pub run_scripts: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self { run_scripts: true }
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

impl UserConfig {
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
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&UserConfig::default()).unwrap();
        assert!(text.contains("[client.retry]"));
        assert!(text.contains("attempts = 10"));
        assert!(text.contains("run_scripts = true"));
    }

    #[test]
    fn retry_and_port_are_configurable() {
        let cfg: UserConfig = toml::from_str(
            r#"
            [client.bus]
            port = 12000

            [client.retry]
            attempts = 3
            backoff_ms = 500

            [session]
            run_scripts = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.client.bus.port, 12000);
        assert_eq!(cfg.client.bus.host, "127.0.0.1");
        assert_eq!(cfg.client.retry.attempts, 3);
        assert_eq!(cfg.client.retry.backoff_ms, 500);
        assert_eq!(cfg.client.inbox_capacity, 32);
        assert!(!cfg.session.run_scripts);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("oga-user-{}.toml", std::process::id()));
        std::fs::write(&path, "client = 7").unwrap();
        let cfg = UserConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.client.bus.port, 10398);
    }
}
