//! `tokio_util` codec for the bus wire format.
//!
//! Decoding is an explicit state machine fed from the framed reader's
//! accumulation buffer, so frames may arrive split at any byte boundary
//! or several at once:
//!
//! ```text
//!  AwaitMagic ──► ReadKind ──► ReadLenLo ──► ReadLenHi ──► ReadBody
//!  (client only)     ▲                           │ len==0       │
//!                    └───────────────────────────┴──────────────┘
//! ```
//!
//! A client-role codec reads server notifications, which carry the magic
//! marker; a server-role codec reads client requests, which do not.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace, warn};

use crate::error::BusError;
use crate::frame::{Frame, MAGIC};
use crate::message::{Direction, MessageKind};

/// Which end of the bus a codec sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The service: writes notifications, reads requests.
    Server,
    /// The session agent: writes requests, reads notifications.
    Client,
}

impl Role {
    /// Outbound frames from the server carry the magic marker.
    pub fn writes_magic(&self) -> bool {
        matches!(self, Role::Server)
    }

    pub fn inbound_direction(&self) -> Direction {
        match self {
            Role::Server => Direction::ClientToServer,
            Role::Client => Direction::ServerToClient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitMagic,
    ReadKind,
    ReadLenLo { kind: u8 },
    ReadLenHi { kind: u8, lo: u8 },
    ReadBody { kind: u8, len: usize },
}

#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    state: DecodeState,
    /// Bytes skipped while hunting for the magic marker.
    skipped: usize,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: Self::initial_state(role),
            skipped: 0,
        }
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn initial_state(role: Role) -> DecodeState {
        match role {
            Role::Client => DecodeState::AwaitMagic,
            Role::Server => DecodeState::ReadKind,
        }
    }

    fn is_idle(&self) -> bool {
        self.state == Self::initial_state(self.role)
    }

    fn reset(&mut self) {
        self.state = Self::initial_state(self.role);
    }

    /// Close out the current frame and validate its kind for this role.
    ///
    /// `Ok(None)` means the frame was dropped and decoding continues.
    fn complete(&mut self, kind: u8, payload: BytesMut) -> Result<Option<Frame>, BusError> {
        self.reset();
        match MessageKind::for_direction(kind, self.role.inbound_direction()) {
            Ok(kind) => {
                trace!(%kind, len = payload.len(), "frame decoded");
                Frame::new(kind, payload.freeze()).map(Some)
            }
            Err(e) => match self.role {
                Role::Server => {
                    warn!(
                        "dropping frame with unknown kind {kind:#04x} ({} bytes)",
                        payload.len()
                    );
                    Ok(None)
                }
                Role::Client => {
                    error!("protocol violation from service: {e}");
                    Err(e)
                }
            },
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitMagic => {
                    if src.len() < MAGIC.len() {
                        return Ok(None);
                    }
                    if src[..MAGIC.len()] == MAGIC {
                        src.advance(MAGIC.len());
                        if self.skipped > 0 {
                            debug!("resynchronised after skipping {} bytes", self.skipped);
                            self.skipped = 0;
                        }
                        self.state = DecodeState::ReadKind;
                    } else {
                        // Slide the window by one byte.
                        src.advance(1);
                        self.skipped += 1;
                    }
                }
                DecodeState::ReadKind => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let kind = src.get_u8();
                    self.state = DecodeState::ReadLenLo { kind };
                }
                DecodeState::ReadLenLo { kind } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let lo = src.get_u8();
                    self.state = DecodeState::ReadLenHi { kind, lo };
                }
                DecodeState::ReadLenHi { kind, lo } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let hi = src.get_u8();
                    let len = u16::from_le_bytes([lo, hi]) as usize;
                    if len == 0 {
                        if let Some(frame) = self.complete(kind, BytesMut::new())? {
                            return Ok(Some(frame));
                        }
                        continue;
                    }
                    src.reserve(len.saturating_sub(src.len()));
                    self.state = DecodeState::ReadBody { kind, len };
                }
                DecodeState::ReadBody { kind, len } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    if let Some(frame) = self.complete(kind, body)? {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() || !self.is_idle() {
            warn!(
                state = ?self.state,
                leftover = buf.len(),
                "stream closed in the middle of a frame"
            );
            buf.clear();
            self.reset();
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = BusError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(self.role.writes_magic(), dst);
        Ok(())
    }
}
