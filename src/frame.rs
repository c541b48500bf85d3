//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! [`OpCode`] is the only public piece; the [`Frame`] value itself stays
//! inside the crate, the message API deals in `(OpCode, Bytes)` pairs.

use bytes::BytesMut;

use crate::{close::CloseCode, mask, WebSocketError};

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes and
/// a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Control frame payloads may not exceed 125 bytes.
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code determining the meaning of a frame.
///
/// Data frames carry application payload:
/// - `Continuation` continues a fragmented message,
/// - `Text` carries UTF-8 text,
/// - `Binary` carries raw bytes.
///
/// Control frames manage the connection and are handled by the engine, never
/// surfacing to the caller:
/// - `Close` runs the closing handshake,
/// - `Ping` is answered inline with a `Pong`,
/// - `Pong` is discarded.
///
/// The remaining 4-bit values (0x3-0x7, 0xB-0xF) are reserved and rejected
/// at parse time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and their payload must not exceed
    /// 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that may start a
    /// message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Interprets the low nibble of the first header byte. Reserved values
    /// are a protocol violation.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::ProtocolViolation),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single wire frame: header fields plus payload.
///
/// RSV2 and RSV3 never appear here, the decoder rejects them outright. RSV1
/// survives because its validity depends on connection state (compression
/// negotiated, first fragment of a data message) that only the engine knows.
pub(crate) struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Per-message compression bit.
    pub rsv1: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key, present on every client-to-server frame.
    pub mask: Option<[u8; 4]>,
    /// Payload bytes, still masked if `mask` is set.
    pub payload: BytesMut,
}

impl Frame {
    /// A final, unmasked, uncompressed frame.
    pub fn new(opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A final data frame, with the compression bit reflecting whether the
    /// payload went through the deflate pipeline.
    pub fn data(opcode: OpCode, rsv1: bool, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin: true,
            rsv1,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// A pong frame echoing `payload`.
    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// A close frame with a status code and reason.
    pub fn close(code: CloseCode, reason: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(OpCode::Close, payload)
    }

    /// A close frame with a raw payload, used to echo the peer's close
    /// verbatim. No validation is applied.
    pub fn close_raw(payload: impl Into<BytesMut>) -> Self {
        Self::new(OpCode::Close, payload)
    }

    /// Masks the payload in place with a fresh key. Client role only.
    pub fn mask(&mut self) {
        let key = mask::make_masking_key();
        mask::apply_mask(&mut self.payload, key);
        self.mask = Some(key);
    }

    /// Reverses the peer's masking in place. Server role only.
    pub fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            mask::apply_mask(&mut self.payload, key);
        }
    }

    /// Packs the header into `head`, returning the number of bytes written.
    ///
    /// The minimal length encoding is always chosen: one length byte up to
    /// 125, `126` plus a u16 up to 65535, `127` plus a u64 above. No RSV bit
    /// other than the requested RSV1 is ever set.
    pub fn fmt_head(&self, head: &mut [u8; MAX_HEAD_SIZE]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv1 as u8) << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let mut size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(key) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&key);
            size += 4;
        }

        size
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        let len = self.payload.len();
        let head = if len < 126 {
            2
        } else if len < 65536 {
            4
        } else {
            10
        };
        head + if self.mask.is_some() { 4 } else { 0 } + len
    }
}
