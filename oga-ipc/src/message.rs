//! Message kinds and the payload layouts they carry.
//!
//! Kind bytes parse through `TryFrom`, so an unknown byte is an error
//! value rather than a panic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

// ── Direction ────────────────────────────────────────────────────

/// Which way a frame travels on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Notification pushed by the service to a session agent.
    ServerToClient,
    /// Request sent by a session agent to the service.
    ClientToServer,
}

// ── MessageKind ──────────────────────────────────────────────────

/// Every kind byte understood by the bus.
///
/// Values are part of the wire format and never change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // ── Notifications (server → client) ──────────────────────────
    /// Log the session user off. Empty payload.
    Logoff = 0xA1,
    /// Module message: `module\0message\0json`.
    Message = 0xB2,
    /// Popup box: JSON `{title, message}`.
    Popup = 0xB3,
    /// Script to run inside the user session.
    Script = 0xC3,

    // ── Requests (client → server) ───────────────────────────────
    /// Module message: `module\0message\0json`.
    ReqMessage = 0xD4,
    /// Session started: `username,language`.
    ReqLogin = 0xE5,
    /// Session ended: `username`.
    ReqLogout = 0xF6,
}

impl TryFrom<u8> for MessageKind {
    type Error = BusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0xA1 => Ok(MessageKind::Logoff),
            0xB2 => Ok(MessageKind::Message),
            0xB3 => Ok(MessageKind::Popup),
            0xC3 => Ok(MessageKind::Script),
            0xD4 => Ok(MessageKind::ReqMessage),
            0xE5 => Ok(MessageKind::ReqLogin),
            0xF6 => Ok(MessageKind::ReqLogout),
            _ => Err(BusError::UnknownKind(value)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Logoff => "LOGOFF",
            MessageKind::Message => "MESSAGE",
            MessageKind::Popup => "POPUP",
            MessageKind::Script => "SCRIPT",
            MessageKind::ReqMessage => "REQ_MESSAGE",
            MessageKind::ReqLogin => "REQ_LOGIN",
            MessageKind::ReqLogout => "REQ_LOGOUT",
        };
        f.write_str(name)
    }
}

impl MessageKind {
    /// The direction this kind is allowed to travel.
    pub fn direction(&self) -> Direction {
        match self {
            MessageKind::Logoff
            | MessageKind::Message
            | MessageKind::Popup
            | MessageKind::Script => Direction::ServerToClient,
            MessageKind::ReqMessage | MessageKind::ReqLogin | MessageKind::ReqLogout => {
                Direction::ClientToServer
            }
        }
    }

    /// Parse a kind byte, accepting it only if it travels in `direction`.
    pub fn for_direction(value: u8, direction: Direction) -> Result<Self, BusError> {
        let kind = Self::try_from(value)?;
        if kind.direction() == direction {
            Ok(kind)
        } else {
            Err(BusError::UnknownKind(value))
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────

/// `REQ_LOGIN` body: `username,language`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    pub language: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            language: language.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{},{}", self.username, self.language).into_bytes()
    }

    /// Splits on the first comma; a missing comma leaves `language` empty.
    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        let text = std::str::from_utf8(payload)?;
        let (username, language) = text.split_once(',').unwrap_or((text, ""));
        Ok(Self::new(username, language))
    }
}

/// `MESSAGE` / `REQ_MESSAGE` body: `module\0message\0json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleMessage {
    pub module: String,
    pub message: String,
    pub data: serde_json::Value,
}

impl ModuleMessage {
    pub fn new(
        module: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        let json = serde_json::to_string(&self.data)?;
        Ok(format!("{}\0{}\0{}", self.module, self.message, json).into_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        let text = std::str::from_utf8(payload)?;
        let mut parts = text.split('\0');
        let (Some(module), Some(message), Some(json), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BusError::InvalidPayload(
                "module message needs exactly three NUL-separated parts",
            ));
        };

        let data = if json.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(json)?
        };
        Ok(Self::new(module, message, data))
    }
}

/// `POPUP` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Popup {
    pub title: String,
    pub message: String,
}

impl Popup {
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
