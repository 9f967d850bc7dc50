//! Error types for the agent message bus.
//!
//! Bus-level operations return `Result<T, BusError>`; module handlers
//! return `Result<(), ModuleError>` which the dispatcher logs and wraps.
//! Nothing here panics on peer input.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the bus.
#[derive(Debug, Error)]
pub enum BusError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A kind byte that the receiving role does not understand.
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    /// A payload does not fit the 16-bit length field.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A payload could not be split into its expected parts.
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// JSON payload encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    // ── Connection Errors ────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The outbound queue stayed full for the whole enqueue timeout.
    #[error("outbound queue full after {0:?}")]
    QueueFull(Duration),

    /// A configuration value cannot be used.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// No bus is attached to send through.
    #[error("not connected")]
    NotConnected,

    /// The component has already been stopped.
    #[error("stopped")]
    Stopped,

    // ── Dispatch Errors ──────────────────────────────────────────
    /// No active module carries the requested name.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// A module with the same name is already registered.
    #[error("duplicate module: {0}")]
    DuplicateModule(String),

    /// A module handler failed.
    #[error("module {module}: {source}")]
    Module {
        module: String,
        #[source]
        source: ModuleError,
    },
}

/// Typed error returned by module handlers.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// `activate()` refused to bring the module up.
    #[error("activation failed: {0}")]
    ActivationFailed(String),

    /// The module does not handle this message name.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// The handler panicked; the panic was contained at the dispatch boundary.
    #[error("handler panicked")]
    Panicked,

    /// Generic handler failure with a human-readable message.
    #[error("{0}")]
    Failed(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BusError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BusError::ChannelClosed
    }
}

impl From<String> for ModuleError {
    fn from(s: String) -> Self {
        ModuleError::Failed(s)
    }
}

impl From<&str> for ModuleError {
    fn from(s: &str) -> Self {
        ModuleError::Failed(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = BusError::UnknownKind(0x42);
        assert!(e.to_string().contains("0x42"));

        let e = BusError::PayloadTooLarge {
            size: 70000,
            max: 65535,
        };
        assert!(e.to_string().contains("70000"));
        assert!(e.to_string().contains("65535"));
    }

    #[test]
    fn module_error_wraps_name() {
        let e = BusError::Module {
            module: "opengnsys".into(),
            source: ModuleError::UnknownMessage("reboot".into()),
        };
        let text = e.to_string();
        assert!(text.contains("opengnsys"));
        assert!(text.contains("reboot"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: BusError = io_err.into();
        assert!(matches!(e, BusError::Io(_)));
    }

    #[test]
    fn from_str_into_module_error() {
        let e: ModuleError = "disk on fire".into();
        assert!(matches!(e, ModuleError::Failed(_)));
    }
}
