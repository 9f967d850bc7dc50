//! # oga-ipc
//!
//! Loopback message bus between the OpenGnsys agent service and the
//! per-session user agents.
//!
//! This crate contains:
//! - **Wire types**: `MessageKind`, `Frame`, and the payload helpers
//!   `LoginRequest`, `ModuleMessage`, `Popup`
//! - **Codec**: `FrameCodec` for framed TCP I/O via `tokio_util`
//! - **Network**: `Connection` (one socket, read and write loops),
//!   `ServerMultiplexer` (service side) and `ClientAgentLink` (session side)
//! - **Dispatch**: `ModuleDispatch` routing bus traffic to named `Module`s,
//!   plus the bundled `opengnsys` session reporter
//! - **Config**: serde-backed tunables and the connect `RetryPolicy`
//! - **Error**: `BusError` / `ModuleError`, `thiserror`-based

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;
pub mod network;
pub mod retry;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{FrameCodec, Role};
pub use config::{BusConfig, ClientConfig, ConnectionConfig, ServerConfig};
pub use dispatch::{
    LocalOperations, LogNotifier, Module, ModuleDispatch, ModuleState, Notifier, Operations,
    SessionReporter,
};
pub use error::{BusError, ModuleError};
pub use frame::{Frame, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};
pub use message::{Direction, LoginRequest, MessageKind, ModuleMessage, Popup};
pub use network::{
    ClientAgentLink, Connection, FrameReader, InboundHandler, ServerHandle, ServerMultiplexer,
    SessionBus, SessionId,
};
pub use retry::RetryPolicy;
