//! WebSocket protocol engine with per-message DEFLATE compression.
//!
//! `riptide` turns a raw byte stream into an ordered, message-oriented duplex
//! channel per [RFC 6455], with the `permessage-deflate` extension from
//! [RFC 7692], for both client and server roles.
//!
//! # Server
//!
//! An [`Upgrader`] validates the HTTP upgrade request, negotiates the
//! subprotocol and compression, and seizes the underlying stream through
//! hyper's upgrade machinery:
//!
//! ```no_run
//! use hyper::{body::Incoming, Request};
//! use riptide::{Options, Upgrader};
//!
//! async fn handle(mut req: Request<Incoming>) -> riptide::Result<riptide::HttpResponse> {
//!     let upgrader = Upgrader::new(Options::default());
//!     let (response, fut) = match upgrader.upgrade(&mut req) {
//!         Ok(ok) => ok,
//!         Err(err) => return Ok(Upgrader::rejection(&err)),
//!     };
//!
//!     tokio::spawn(async move {
//!         let mut ws = fut.await?;
//!         let (opcode, payload) = ws.next_message().await?;
//!         ws.send_message(opcode, &payload).await?;
//!         ws.close().await;
//!         riptide::Result::Ok(())
//!     });
//!
//!     Ok(response)
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use riptide::{OpCode, WebSocket};
//!
//! # async fn run() -> riptide::Result<()> {
//! let mut ws = WebSocket::connect("wss://echo.example.com/ws".parse()?).await?;
//! ws.send_message(OpCode::Text, b"hello").await?;
//! let (_, payload) = ws.next_message().await?;
//! ws.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! A connection is single-producer single-consumer by construction: every
//! operation takes `&mut self`, so the inline pong answered from inside
//! [`WebSocket::next_message`] can never race an application send.
//!
//! [RFC 6455]: https://datatracker.ietf.org/doc/html/rfc6455
//! [RFC 7692]: https://datatracker.ietf.org/doc/html/rfc7692

pub mod close;
pub mod frame;

mod client;
mod codec;
mod conn;
mod deflate;
mod extension;
mod handshake;
mod mask;
mod server;
mod stream;

use thiserror::Error;

pub use client::{CookieProvider, HttpRequestBuilder, WebSocketBuilder};
pub use conn::{Options, WebSocket, DEFAULT_READ_BUFFER, MAX_MESSAGE_SIZE, MAX_PAYLOAD_READ};
pub use deflate::{CompressionLevel, DeflateOptions};
pub use frame::OpCode;
pub use server::{HttpResponse, UpgradeFut, UpgradedStream, Upgrader};
pub use stream::MaybeTlsStream;

/// A result type for WebSocket operations, using [`WebSocketError`] as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors surfaced by the protocol engine.
///
/// The taxonomy is deliberately small. Every error returned from
/// [`WebSocket::next_message`] or [`WebSocket::send_message`] means the
/// connection is closed, with one exception: [`InvalidMessageType`] is a
/// precondition violation and leaves the connection usable.
///
/// Protocol violations cause a best-effort close frame on the wire before the
/// error is returned; a failure of that outbound write is swallowed, the
/// connection is torn down regardless.
///
/// [`InvalidMessageType`]: WebSocketError::InvalidMessageType
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// [`WebSocket::send_message`] was called with an opcode other than
    /// `Text` or `Binary`. Control frames are managed by the engine and
    /// cannot be sent through the message API.
    #[error("message type must be text or binary")]
    InvalidMessageType,

    /// The opening handshake failed. The inner value states which check
    /// failed; on the server side [`Upgrader::rejection`] maps it to the
    /// appropriate 4xx response.
    #[error("bad handshake: {0}")]
    BadHandshake(#[from] HandshakeError),

    /// The peer broke a framing rule: reserved bits, an unknown opcode, a
    /// masking-direction mismatch, an illegal fragment sequence, an oversize
    /// or fragmented control frame, or a close code outside the allowed set.
    /// A close frame with status 1002 has been sent.
    #[error("close 1002 (protocol violation)")]
    ProtocolViolation,

    /// A text payload (single frame or reassembled) or a close reason was
    /// not valid UTF-8. A close frame with status 1007 has been sent.
    #[error("close 1007 (invalid utf-8 payload)")]
    InvalidUtf8,

    /// The peer sent a close frame and the engine echoed it. This is the
    /// terminal success of the read loop, not a failure.
    #[error("close 1000 (normal closure)")]
    NormalClose,

    /// The underlying stream ended without a close handshake. No outbound
    /// close frame is attempted.
    #[error("peer closed the stream unexpectedly")]
    UnexpectedClose,

    /// A caller-supplied request header collides with one of the reserved
    /// WebSocket handshake headers.
    #[error("request headers collide with reserved websocket headers")]
    DuplicateHeaders,

    /// The dial URL is not a usable `ws`/`wss` URL (wrong scheme, or
    /// credentials embedded in the authority).
    #[error("malformed websocket url")]
    BadUrl,

    /// A frame or reassembled message exceeded the configured size limits.
    /// A close frame with status 1009 has been sent.
    #[error("close 1009 (message too large)")]
    FrameTooLarge,

    /// An I/O error on the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error from hyper while driving the HTTP half of the handshake.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// The dial URL failed to parse.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
}

/// The specific check that failed during the opening handshake.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request method was not `GET`.
    #[error("method not allowed")]
    Method,

    /// `Upgrade: websocket` was missing or mismatched.
    #[error("missing or mismatched Upgrade header")]
    UpgradeHeader,

    /// `Connection: Upgrade` was missing or mismatched.
    #[error("missing or mismatched Connection header")]
    ConnectionHeader,

    /// The peer does not speak protocol version 13. Server side this means
    /// the request's `Sec-WebSocket-Version` was wrong; client side it means
    /// the response carried a `Sec-WebSocket-Version` hint, i.e. the server
    /// rejected ours.
    #[error("unsupported Sec-WebSocket-Version")]
    Version,

    /// The origin check rejected the request.
    #[error("origin not allowed")]
    Origin,

    /// `Sec-WebSocket-Key` was missing or did not decode to 16 bytes.
    #[error("missing or invalid Sec-WebSocket-Key")]
    Key,

    /// The server answered the upgrade request with something other than
    /// `101 Switching Protocols`.
    #[error("unexpected status code {0}")]
    Status(u16),

    /// `Sec-WebSocket-Accept` did not match the challenge key derivation.
    #[error("Sec-WebSocket-Accept mismatch")]
    Accept,

    /// The server selected a subprotocol that was never offered.
    #[error("server selected a subprotocol that was not offered")]
    Subprotocol,

    /// The server acknowledged an extension that was never offered, or one
    /// this engine does not implement.
    #[error("server accepted an extension that was not offered")]
    Extensions,
}
