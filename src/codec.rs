//! Frame-level codec for [`tokio_util::codec::Framed`].
//!
//! The decoder parses in stages (fixed header, extended length plus masking
//! key, payload) and only consumes bytes once the stage they belong to is
//! complete, so a short read never eats a partial frame: the buffer is left
//! exactly as it was and the next poll resumes from the same stage.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    WebSocketError,
};

/// Fixed header fields, parsed from the first two bytes.
struct Head {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// 7-bit length field; 126 and 127 select an extended encoding.
    length_code: u8,
    /// Bytes still needed after the first two: extended length plus key.
    trailing: usize,
}

/// Header fields with the payload length and masking key resolved.
struct ResolvedHead {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Decoder progress across `decode` calls.
enum ReadState {
    Head(Head),
    Payload(ResolvedHead),
}

/// Decoder for incoming WebSocket frames.
///
/// Framing violations that need no connection state are rejected here:
/// reserved opcodes, RSV2/RSV3, fragmented or oversize control frames, and
/// payloads above the configured cap. RSV1 and masking direction are left to
/// the engine, their validity depends on negotiation and role.
pub(crate) struct Decoder {
    state: Option<ReadState>,
    max_payload_read: usize,
}

impl Decoder {
    pub(crate) fn new(max_payload_read: usize) -> Self {
        Self {
            state: None,
            max_payload_read,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;

                    // RSV2/RSV3 are never negotiated.
                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WebSocketError::ProtocolViolation);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let trailing = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Head(Head {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        trailing,
                    }));
                }
                Some(ReadState::Head(head)) => {
                    if src.remaining() < head.trailing {
                        self.state = Some(ReadState::Head(head));
                        return Ok(None);
                    }

                    // Lenient on minimality: a 2-byte encoding of a value
                    // below 126 is accepted.
                    let payload_len = match head.length_code {
                        126 => src.get_u16() as u64,
                        127 => src.get_u64(),
                        short => u64::from(short),
                    };
                    let payload_len = usize::try_from(payload_len)
                        .map_err(|_| WebSocketError::FrameTooLarge)?;

                    let mask = head.masked.then(|| src.get_u32().to_be_bytes());

                    if head.opcode.is_control() {
                        if !head.fin || payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ProtocolViolation);
                        }
                    } else if payload_len > self.max_payload_read {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(ResolvedHead {
                        fin: head.fin,
                        rsv1: head.rsv1,
                        opcode: head.opcode,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(head)) => {
                    if src.remaining() < head.payload_len {
                        self.state = Some(ReadState::Payload(head));
                        return Ok(None);
                    }

                    let payload = src.split_to(head.payload_len);
                    break Ok(Some(Frame {
                        fin: head.fin,
                        rsv1: head.rsv1,
                        opcode: head.opcode,
                        mask: head.mask,
                        payload,
                    }));
                }
            }
        }
    }

    /// A stream that ends mid-frame, or mid-connection with no frame in
    /// flight, is an unexpected close rather than a clean end of stream.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.state.is_none() => Ok(None),
            None => Err(WebSocketError::UnexpectedClose),
        }
    }
}

/// Encoder for outgoing WebSocket frames.
///
/// Header and payload land in the same write buffer, so a frame reaches the
/// stream as a single write.
pub(crate) struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Combined decoder/encoder for [`Framed`](tokio_util::codec::Framed).
pub(crate) struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    pub(crate) fn new(max_payload_read: usize) -> Self {
        Self {
            decoder: Decoder::new(max_payload_read),
            encoder: Encoder,
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = WebSocketError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        self.decoder.decode(src)
    }

    #[inline]
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        self.decoder.decode_eof(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        self.encoder.encode(frame, dst)
    }
}
