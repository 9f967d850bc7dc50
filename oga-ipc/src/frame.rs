use bytes::{BufMut, Bytes, BytesMut};

use crate::error::BusError;
use crate::message::MessageKind;

/// Marker prefixed to every server → client frame ("OGA" padded with a zero).
pub const MAGIC: [u8; 4] = [0x4F, 0x47, 0x41, 0x00];

/// Kind byte plus the two little-endian length bytes.
pub const HEADER_SIZE: usize = 3;

/// The length field is 16 bits wide.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// One discrete message on the wire.
///
/// The payload length always fits the 16-bit length field; this is
/// checked once in [`Frame::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: MessageKind,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Result<Self, BusError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BusError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { kind, payload })
    }

    /// A frame without a body.
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize as `[MAGIC] KIND LEN_LO LEN_HI PAYLOAD`.
    pub fn encode_into(&self, with_magic: bool, dst: &mut BytesMut) {
        let magic_len = if with_magic { MAGIC.len() } else { 0 };
        dst.reserve(magic_len + HEADER_SIZE + self.payload.len());
        if with_magic {
            dst.put_slice(&MAGIC);
        }
        dst.put_u8(self.kind as u8);
        // Bounded by MAX_PAYLOAD_SIZE at construction.
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }

    pub fn encode(&self, with_magic: bool) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(with_magic, &mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_too_large_rejected() {
        let too_large = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = Frame::new(MessageKind::Script, too_large);
        assert!(matches!(
            result,
            Err(BusError::PayloadTooLarge { size: 65536, .. })
        ));
    }

    #[test]
    fn max_payload_accepted() {
        let frame = Frame::new(MessageKind::Script, vec![7u8; MAX_PAYLOAD_SIZE]).unwrap();
        let bytes = frame.encode(false);
        assert_eq!(bytes[1], 0xFF);
        assert_eq!(bytes[2], 0xFF);
        assert_eq!(bytes.len(), HEADER_SIZE + MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn server_layout_has_magic() {
        let frame = Frame::new(MessageKind::Message, &b"abc"[..]).unwrap();
        assert_eq!(
            &frame.encode(true)[..],
            &[0x4F, 0x47, 0x41, 0x00, 0xB2, 0x03, 0x00, b'a', b'b', b'c']
        );
    }

    #[test]
    fn client_layout_has_no_magic() {
        let frame = Frame::new(MessageKind::ReqLogin, vec![b'x'; 0x0102]).unwrap();
        let bytes = frame.encode(false);
        assert_eq!(bytes[0], 0xE5);
        // Low byte first.
        assert_eq!(bytes[1], 0x02);
        assert_eq!(bytes[2], 0x01);
    }

    #[test]
    fn empty_frame() {
        let frame = Frame::empty(MessageKind::Logoff);
        assert!(frame.is_empty());
        assert_eq!(&frame.encode(false)[..], &[0xA1, 0x00, 0x00]);
    }
}
