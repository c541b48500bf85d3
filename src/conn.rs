//! The connection: message reassembly, control handling and the close state
//! machine on the read side; threshold compression and masking on the write
//! side.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{
    close::CloseCode,
    codec::Codec,
    deflate::{DeflateOptions, DeflatePipeline, PipelineSettings},
    extension::DeflateOffer,
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// Default capacity of the read buffer, 4 KiB.
pub const DEFAULT_READ_BUFFER: usize = 4 * 1024;

/// Default cap on a single frame's payload, 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Default cap on a reassembled (and inflated) message, 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Configuration for a WebSocket connection, used by both the server-side
/// [`Upgrader`](crate::Upgrader) and the client dialer.
///
/// ```
/// use riptide::{DeflateOptions, Options};
///
/// let options = Options::default()
///     .with_subprotocols(["chat"])
///     .with_compression(DeflateOptions::default());
/// ```
#[derive(Clone, Default)]
pub struct Options {
    /// Capacity of the buffered reader in front of the stream.
    ///
    /// Default: 4 KiB ([`DEFAULT_READ_BUFFER`]).
    pub read_buffer_size: Option<usize>,

    /// Maximum payload length accepted for a single frame. Frames declaring
    /// more are rejected with close code 1009 before their payload is read.
    ///
    /// Default: 1 MiB ([`MAX_PAYLOAD_READ`]).
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled message, applied to the fragment
    /// accumulation buffer and to inflated output.
    ///
    /// Default: 2 MiB ([`MAX_MESSAGE_SIZE`]), or twice `max_payload_read`
    /// when that is set.
    pub max_message_size: Option<usize>,

    /// Subprotocols in order of preference: offered by the client, matched
    /// against the client's offer by the server.
    pub subprotocols: Vec<String>,

    /// Per-message DEFLATE settings. `None` disables the extension: it is
    /// neither offered nor accepted.
    pub compression: Option<DeflateOptions>,
}

impl Options {
    /// Sets the read buffer capacity.
    pub fn with_read_buffer_size(self, size: usize) -> Self {
        Self {
            read_buffer_size: Some(size),
            ..self
        }
    }

    /// Caps single-frame payloads at `size` bytes.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Caps reassembled messages at `size` bytes.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Sets the subprotocol preference list.
    pub fn with_subprotocols<I, T>(self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            subprotocols: subprotocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Enables permessage-deflate with the given settings.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }
}

/// Which end of the connection this is; decides the masking direction.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Everything the handshake settled on, handed to the connection
/// constructor.
#[derive(Debug)]
pub(crate) struct Negotiation {
    pub(crate) subprotocol: String,
    pub(crate) compression: Option<PipelineSettings>,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_payload_read: usize,
    pub(crate) max_message_size: usize,
}

impl Negotiation {
    /// Combines local options with the peer's accepted extension offer.
    ///
    /// Compression is live only when configured locally *and* acknowledged
    /// by the peer; context takeover additionally requires that neither side
    /// sent a `no_context_takeover` flag.
    pub(crate) fn new(options: &Options, subprotocol: String, offer: Option<DeflateOffer>) -> Self {
        let compression = match (options.compression.as_ref(), offer) {
            (Some(opts), Some(offer)) => {
                let takeover = opts.context_takeover && !offer.no_takeover();
                Some(PipelineSettings::resolve(opts, takeover))
            }
            _ => None,
        };

        let max_payload_read = options.max_payload_read.unwrap_or(MAX_PAYLOAD_READ);
        // The message cap should leave room for at least two max-size frames
        // when only the frame cap was given.
        let max_message_size = options
            .max_message_size
            .unwrap_or(options.max_payload_read.map(|p| p * 2).unwrap_or(MAX_MESSAGE_SIZE));

        Self {
            subprotocol,
            compression,
            read_buffer_size: options.read_buffer_size.unwrap_or(DEFAULT_READ_BUFFER),
            max_payload_read,
            max_message_size,
        }
    }
}

/// First-fragment metadata kept while a fragmented message is assembling.
#[derive(Copy, Clone)]
struct Fragment {
    opcode: OpCode,
    compressed: bool,
}

/// A live WebSocket connection over `S`.
///
/// Produced by [`Upgrader::upgrade`](crate::Upgrader::upgrade) on the server
/// and [`WebSocket::connect`] / [`WebSocket::handshake`] on the client; the
/// engine itself is identical for both roles apart from the masking
/// direction.
///
/// The connection is strictly single-caller: all operations take
/// `&mut self`. [`next_message`] transparently answers pings, discards
/// pongs, reassembles fragmented messages and runs the closing handshake;
/// control frames never surface to the caller.
///
/// [`next_message`]: WebSocket::next_message
pub struct WebSocket<S> {
    stream: Framed<S, Codec>,
    role: Role,
    subprotocol: String,
    /// Present iff both peers negotiated permessage-deflate.
    deflate: Option<DeflatePipeline>,
    /// `Some` while between a first fragment and its final continuation.
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    max_message_size: usize,
    closed: bool,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(role: Role, stream: S, negotiation: Negotiation) -> Self {
        let mut stream = Framed::new(stream, Codec::new(negotiation.max_payload_read));
        stream.read_buffer_mut().reserve(negotiation.read_buffer_size);

        Self {
            stream,
            role,
            subprotocol: negotiation.subprotocol,
            deflate: negotiation.compression.map(DeflatePipeline::new),
            fragment: None,
            accumulated: BytesMut::new(),
            max_message_size: negotiation.max_message_size,
            closed: false,
        }
    }

    /// The subprotocol agreed on during the handshake, or the empty string
    /// if none was negotiated.
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Reads the next application message.
    ///
    /// Suspends only at reads of the underlying stream. Pings received along
    /// the way are answered with an identical pong inline; pongs are
    /// discarded; fragments are reassembled (a message is delivered when its
    /// final fragment arrives, in wire order).
    ///
    /// # Errors
    ///
    /// - [`WebSocketError::NormalClose`] once the peer's close frame has
    ///   been received and echoed,
    /// - [`WebSocketError::UnexpectedClose`] if the stream ends without a
    ///   close handshake,
    /// - [`WebSocketError::ProtocolViolation`], [`WebSocketError::InvalidUtf8`]
    ///   or [`WebSocketError::FrameTooLarge`] after the matching close frame
    ///   (1002 / 1007 / 1009) has been sent on a best-effort basis.
    ///
    /// Every error leaves the connection closed.
    pub async fn next_message(&mut self) -> Result<(OpCode, Bytes)> {
        while !self.closed {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(self.reject(err).await),
                None => {
                    self.shutdown().await;
                    return Err(WebSocketError::UnexpectedClose);
                }
            };

            if let Some(message) = self.on_frame(frame).await? {
                return Ok(message);
            }
        }

        Err(WebSocketError::UnexpectedClose)
    }

    /// Sends one text or binary message, returning the number of bytes that
    /// went on the wire (header included).
    ///
    /// With compression negotiated, payloads at or above the configured
    /// threshold are deflated and sent with RSV1 set; shorter payloads go
    /// out uncompressed with RSV1 clear. Client connections mask the
    /// (possibly compressed) payload with a fresh key. Header and payload
    /// are flushed as a single write.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::InvalidMessageType`] for a control opcode; unlike
    /// every other error, it leaves the connection usable.
    pub async fn send_message(&mut self, opcode: OpCode, payload: &[u8]) -> Result<usize> {
        if !opcode.is_data() {
            return Err(WebSocketError::InvalidMessageType);
        }
        if self.closed {
            return Err(WebSocketError::UnexpectedClose);
        }

        let compressed = match self.deflate.as_mut() {
            Some(pipeline) if payload.len() >= pipeline.threshold() => {
                Some(pipeline.compress(payload))
            }
            _ => None,
        };

        let frame = match compressed {
            Some(Ok(output)) => Frame::data(opcode, true, &output[..]),
            Some(Err(err)) => {
                self.shutdown().await;
                return Err(err.into());
            }
            None => Frame::data(opcode, false, payload),
        };

        match self.send_frame(frame).await {
            Ok(written) => Ok(written),
            Err(err) => {
                self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Closes the connection: sends a close frame (1001 as server, 1000 as
    /// client), shuts the stream down and repays the compression pool.
    /// Idempotent; errors on the outbound close are swallowed.
    pub async fn close(&mut self) {
        if !self.closed {
            let code = match self.role {
                Role::Server => CloseCode::Away,
                Role::Client => CloseCode::Normal,
            };
            let _ = self.send_frame(Frame::close(code, &[])).await;
            self.shutdown().await;
        } else {
            // A handler may have torn the stream down without dropping the
            // pipeline; make sure the pools are repaid either way.
            self.deflate = None;
        }
    }

    /// Runs one frame through the state machine. `Ok(None)` means the frame
    /// was consumed (control frame or non-final fragment) and the read loop
    /// continues.
    async fn on_frame(&mut self, mut frame: Frame) -> Result<Option<(OpCode, Bytes)>> {
        // RSV1 is valid only on a first Text/Binary fragment with
        // compression negotiated. RSV2/RSV3 never got past the decoder.
        let rsv1_allowed =
            self.deflate.is_some() && frame.opcode.is_data() && self.fragment.is_none();
        if frame.rsv1 && !rsv1_allowed {
            return Err(self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await);
        }

        // A server must see masked frames, a client unmasked ones.
        if self.fragment.is_none() && frame.mask.is_some() != (self.role == Role::Server) {
            return Err(self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await);
        }

        if self.role == Role::Server {
            frame.unmask();
        }

        match frame.opcode {
            OpCode::Ping => {
                // FIN and the 125-byte cap were enforced by the decoder;
                // answer with an identical payload before reading on.
                if let Err(err) = self.send_frame(Frame::pong(frame.payload)).await {
                    self.shutdown().await;
                    return Err(err);
                }
                Ok(None)
            }
            OpCode::Pong => Ok(None),
            OpCode::Close => Err(self.on_close(frame).await),
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    // A new data message may not start mid-assembly.
                    return Err(
                        self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await
                    );
                }

                if !frame.fin {
                    self.fragment = Some(Fragment {
                        opcode: frame.opcode,
                        compressed: frame.rsv1,
                    });
                    return self.accumulate(&frame.payload).await.map(|()| None);
                }

                let payload = if frame.rsv1 {
                    self.inflate(&frame.payload).await?
                } else {
                    frame.payload.freeze()
                };
                self.deliver(frame.opcode, payload).await.map(Some)
            }
            OpCode::Continuation => {
                let Some(fragment) = self.fragment else {
                    return Err(
                        self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await
                    );
                };

                self.accumulate(&frame.payload).await?;
                if !frame.fin {
                    return Ok(None);
                }

                self.fragment = None;
                let whole = self.accumulated.split();
                let payload = if fragment.compressed {
                    self.inflate(&whole).await?
                } else {
                    whole.freeze()
                };
                self.deliver(fragment.opcode, payload).await.map(Some)
            }
        }
    }

    /// Appends fragment bytes, enforcing the message cap.
    async fn accumulate(&mut self, payload: &[u8]) -> Result<()> {
        self.accumulated.extend_from_slice(payload);
        if self.accumulated.len() > self.max_message_size {
            return Err(self.fail(CloseCode::Size, WebSocketError::FrameTooLarge).await);
        }
        Ok(())
    }

    /// Inflates a complete compressed message.
    async fn inflate(&mut self, input: &[u8]) -> Result<Bytes> {
        let max_size = self.max_message_size;
        let inflated = self
            .deflate
            .as_mut()
            .expect("compression negotiated")
            .decompress(input, max_size);

        match inflated {
            Ok(output) => Ok(Bytes::from(output)),
            Err(WebSocketError::FrameTooLarge) => {
                Err(self.fail(CloseCode::Size, WebSocketError::FrameTooLarge).await)
            }
            Err(_) => Err(self.fail(CloseCode::Error, WebSocketError::ProtocolViolation).await),
        }
    }

    /// Final validation before handing a message to the caller. Text is
    /// checked for UTF-8 here, i.e. after unmasking, inflating and
    /// reassembly, so code points split across fragment boundaries validate
    /// correctly.
    async fn deliver(&mut self, opcode: OpCode, payload: Bytes) -> Result<(OpCode, Bytes)> {
        if opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
            return Err(self.fail(CloseCode::Invalid, WebSocketError::InvalidUtf8).await);
        }
        Ok((opcode, payload))
    }

    /// Handles the peer's close frame: validate, echo, tear down. Always
    /// produces the error that terminates the read loop.
    async fn on_close(&mut self, frame: Frame) -> WebSocketError {
        let payload = frame.payload;

        // An empty close carries no status; answer with a normal closure.
        if payload.is_empty() {
            let _ = self.send_frame(Frame::close(CloseCode::Normal, &[])).await;
            self.shutdown().await;
            return WebSocketError::NormalClose;
        }

        // One lone byte cannot hold a status code.
        if payload.len() < 2 {
            return self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await;
        }

        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if !CloseCode::from(code).is_allowed() {
            return self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await;
        }
        if std::str::from_utf8(&payload[2..]).is_err() {
            return self.fail(CloseCode::Invalid, WebSocketError::InvalidUtf8).await;
        }

        #[cfg(feature = "logging")]
        log::debug!("{} echoing close {code}", self.role);

        // Echo status code and reason verbatim.
        let _ = self.send_frame(Frame::close_raw(payload)).await;
        self.shutdown().await;
        WebSocketError::NormalClose
    }

    /// Best-effort close frame, then tear-down. Returns `err` for the caller
    /// to propagate.
    async fn fail(&mut self, code: CloseCode, err: WebSocketError) -> WebSocketError {
        #[cfg(feature = "logging")]
        log::debug!("{} closing with {}: {err}", self.role, u16::from(code));

        let _ = self.send_frame(Frame::close(code, &[])).await;
        self.shutdown().await;
        err
    }

    /// Maps a decode-level error onto the close it deserves.
    async fn reject(&mut self, err: WebSocketError) -> WebSocketError {
        match err {
            WebSocketError::ProtocolViolation => {
                self.fail(CloseCode::Protocol, WebSocketError::ProtocolViolation).await
            }
            WebSocketError::FrameTooLarge => {
                self.fail(CloseCode::Size, WebSocketError::FrameTooLarge).await
            }
            // Unexpected end of stream and transport failures get no
            // outbound close.
            other => {
                self.shutdown().await;
                other
            }
        }
    }

    /// Flushes one frame as a single write, masking first when the role
    /// requires it.
    async fn send_frame(&mut self, mut frame: Frame) -> Result<usize> {
        if self.role == Role::Client {
            frame.mask();
        }
        let written = frame.wire_len();
        self.stream.send(frame).await?;
        Ok(written)
    }

    /// Marks the connection closed, shuts the transport down and repays the
    /// compression pools.
    async fn shutdown(&mut self) {
        self.closed = true;
        self.fragment = None;
        self.deflate = None;
        let _ = self.stream.close().await;
    }
}
