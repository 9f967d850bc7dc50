//! Socket-facing half of the bus: the per-socket connection endpoint, the
//! service-side multiplexer, and the session-side agent link.

pub mod client;
pub mod connection;
pub mod server;

pub use client::ClientAgentLink;
pub use connection::{Connection, FrameReader, InboundHandler, SessionId};
pub use server::{ServerHandle, ServerMultiplexer, SessionBus};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Resolves once `running` flips to false, checking every `poll`.
pub(crate) async fn wait_for_stop(running: &AtomicBool, poll: Duration) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}
