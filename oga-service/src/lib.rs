//! # oga-service — OpenGnsys agent service
//!
//! Privileged background process. Hosts the loopback session bus that
//! the per-user agents connect to, and the server-side modules that react
//! to session logins, logouts and module messages.

pub mod config;
pub mod service;
