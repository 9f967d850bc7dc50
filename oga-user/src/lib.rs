//! # oga-user — OpenGnsys session agent
//!
//! Runs inside each interactive user session. Announces the login to the
//! agent service, carries out the notifications the service pushes back
//! (log off, module messages, pop-ups, scripts) and announces the logout
//! on exit.

pub mod config;
pub mod session;
