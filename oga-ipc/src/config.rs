//! Tunables for the bus, shared by the service and the session agent.
//!
//! Every struct is `#[serde(default)]` so a partial TOML section only
//! overrides what it names.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::retry::RetryPolicy;

/// Where the service listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Loopback address only; the bus has no authentication of its own.
    /// An IP literal (`127.0.0.1`, `::1`) or a name such as `localhost`.
    pub host: String,
    /// TCP port. `0` lets the OS pick one (tests).
    pub port: u16,
}

/// Per-connection queueing and shutdown responsiveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Capacity of the outbound frame queue.
    pub queue_capacity: usize,
    /// Upper bound on any single wait inside a read or write loop.
    pub poll_interval_ms: u64,
    /// How long an enqueue may wait on a full queue before giving up.
    pub enqueue_timeout_ms: u64,
}

/// Session agent side of the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bus: BusConfig,
    pub connection: ConnectionConfig,
    /// Capacity of the inbound notification queue.
    pub inbox_capacity: usize,
    pub retry: RetryPolicy,
}

/// Service side of the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bus: BusConfig,
    pub connection: ConnectionConfig,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10398,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            poll_interval_ms: 1000,
            enqueue_timeout_ms: 500,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            connection: ConnectionConfig::default(),
            inbox_capacity: 32,
            retry: RetryPolicy::default(),
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────

impl BusConfig {
    /// The address to bind or connect to.
    ///
    /// Names go through the system resolver; when it offers both families
    /// the first IPv4 address wins, so both ends of the bus agree.
    pub async fn resolve(&self) -> Result<SocketAddr, BusError> {
        let host = self.host.trim();
        let literal = host.strip_prefix('[').and_then(|h| h.strip_suffix(']'));
        if let Ok(ip) = literal.unwrap_or(host).parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, self.port))
            .await?
            .collect();
        resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| resolved.first())
            .copied()
            .ok_or(BusError::InvalidConfig("bus host did not resolve to any address"))
    }
}

impl ConnectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// A zero-capacity mpsc channel panics, so clamp to one.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_loopback() {
        let cfg = ClientConfig::default();
        let addr = cfg.bus.resolve().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(cfg.connection.queue_capacity(), 32);
        assert_eq!(cfg.retry.attempts, 10);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"bus": {"port": 4000}}"#).unwrap();
        assert_eq!(cfg.bus.port, 4000);
        assert_eq!(cfg.bus.host, "127.0.0.1");
        assert_eq!(cfg.connection.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cfg = ConnectionConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(cfg.queue_capacity(), 1);
    }

    fn bus(host: &str) -> BusConfig {
        BusConfig {
            host: host.into(),
            port: 10398,
        }
    }

    #[tokio::test]
    async fn localhost_resolves_to_loopback() {
        let addr = bus("localhost").resolve().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 10398);
    }

    #[tokio::test]
    async fn ipv6_loopback_with_or_without_brackets() {
        let expected: SocketAddr = "[::1]:10398".parse().unwrap();
        assert_eq!(bus("::1").resolve().await.unwrap(), expected);
        assert_eq!(bus("[::1]").resolve().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn unresolvable_host_is_an_error() {
        assert!(bus("no such host").resolve().await.is_err());
    }
}
