//! Server-side handshake: request validation, negotiation, and the upgrade
//! future that resolves into a connection once hyper has switched protocols.

use std::{future::Future, pin::Pin, sync::Arc, task::Context, task::Poll};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    header::{self, HeaderMap},
    upgrade::Upgraded,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;

use crate::{
    conn::{Negotiation, Options, Role, WebSocket},
    extension::{self, DeflateOffer},
    handshake, HandshakeError, Result, WebSocketError,
};

/// The HTTP response produced by the handshake: the 101 on success, a 4xx
/// from [`Upgrader::rejection`] on failure.
pub type HttpResponse = Response<Empty<Bytes>>;

/// The stream a finished upgrade yields, both server- and client-side.
pub type UpgradedStream = TokioIo<Upgraded>;

/// Pluggable origin policy. Receives the request headers; `false` rejects
/// the handshake with [`HandshakeError::Origin`].
type OriginCheck = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Validates WebSocket upgrade requests and produces the switching-protocols
/// response plus an [`UpgradeFut`].
///
/// ```no_run
/// use hyper::{body::Incoming, Request};
/// use riptide::{DeflateOptions, Options, Upgrader};
///
/// async fn handle(mut req: Request<Incoming>) -> riptide::Result<riptide::HttpResponse> {
///     let upgrader = Upgrader::new(
///         Options::default()
///             .with_subprotocols(["chat"])
///             .with_compression(DeflateOptions::default()),
///     );
///
///     let (response, fut) = match upgrader.upgrade(&mut req) {
///         Ok(ok) => ok,
///         Err(err) => return Ok(Upgrader::rejection(&err)),
///     };
///
///     tokio::spawn(async move {
///         if let Ok(mut ws) = fut.await {
///             while let Ok((opcode, payload)) = ws.next_message().await {
///                 let _ = ws.send_message(opcode, &payload).await;
///             }
///         }
///     });
///
///     Ok(response)
/// }
/// ```
#[derive(Clone, Default)]
pub struct Upgrader {
    options: Options,
    check_origin: Option<OriginCheck>,
}

impl Upgrader {
    /// Creates an upgrader with the given connection options.
    pub fn new(options: Options) -> Self {
        Self {
            options,
            check_origin: None,
        }
    }

    /// Replaces the default same-origin policy (accept when no `Origin`
    /// header is present, otherwise require the origin's authority to equal
    /// `Host`).
    pub fn with_check_origin<F>(mut self, check: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Some(Arc::new(check));
        self
    }

    /// Validates the upgrade request and, on success, returns the 101
    /// response to send back together with the future resolving into the
    /// connection.
    ///
    /// The response must reach the client before the future can complete.
    /// On failure, [`Upgrader::rejection`] turns the error into the
    /// matching 4xx response.
    pub fn upgrade<B>(
        &self,
        mut request: impl std::borrow::BorrowMut<Request<B>>,
    ) -> Result<(HttpResponse, UpgradeFut)> {
        let request = request.borrow_mut();

        if request.method() != hyper::Method::GET {
            return Err(HandshakeError::Method.into());
        }

        let headers = request.headers();
        if !handshake::header_contains_token(headers, header::UPGRADE, "websocket") {
            return Err(HandshakeError::UpgradeHeader.into());
        }
        if !handshake::header_contains_token(headers, header::CONNECTION, "upgrade") {
            return Err(HandshakeError::ConnectionHeader.into());
        }
        if !handshake::header_contains_token(
            headers,
            header::SEC_WEBSOCKET_VERSION,
            handshake::WEBSOCKET_VERSION,
        ) {
            return Err(HandshakeError::Version.into());
        }

        let origin_allowed = match &self.check_origin {
            Some(check) => check(headers),
            None => handshake::same_origin(headers),
        };
        if !origin_allowed {
            return Err(HandshakeError::Origin.into());
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .and_then(|value| value.to_str().ok())
            .ok_or(HandshakeError::Key)?;
        if !handshake::valid_key(key) {
            return Err(HandshakeError::Key.into());
        }
        let accept = handshake::accept_key(key.as_bytes());

        let subprotocol = handshake::select_subprotocol(headers, &self.options.subprotocols);

        // First acceptable permessage-deflate offer wins; anything the
        // engine cannot honor was already skipped during parsing.
        let offer = self.options.compression.as_ref().and_then(|_| {
            extension::accept_offer(
                headers
                    .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
                    .iter()
                    .filter_map(|value| value.to_str().ok()),
            )
        });

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept);

        if let Some(subprotocol) = &subprotocol {
            response = response.header(header::SEC_WEBSOCKET_PROTOCOL, subprotocol.as_str());
        }

        if let (Some(opts), Some(offer)) = (self.options.compression.as_ref(), offer) {
            // The acknowledgment reflects the takeover the connection will
            // actually run with, so a conforming peer resets its context
            // whenever this end does.
            let takeover = opts.context_takeover && !offer.no_takeover();
            let ack = if takeover {
                DeflateOffer::default()
            } else {
                DeflateOffer::without_takeover()
            };
            response = response.header(header::SEC_WEBSOCKET_EXTENSIONS, ack.to_string());

            #[cfg(feature = "logging")]
            log::debug!("accepted permessage-deflate, context_takeover={takeover}");
        }

        let response = response
            .body(Empty::new())
            .expect("bug: failed to build upgrade response");

        let negotiation =
            Negotiation::new(&self.options, subprotocol.unwrap_or_default(), offer);

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            negotiation: Some(negotiation),
        };

        Ok((response, fut))
    }

    /// Builds the 4xx response for a failed upgrade: 405 for a non-GET
    /// method, 426 with a `Sec-WebSocket-Version: 13` hint for a version
    /// mismatch, 400 for everything else.
    pub fn rejection(err: &WebSocketError) -> HttpResponse {
        let response = match err {
            WebSocketError::BadHandshake(HandshakeError::Method) => {
                Response::builder().status(StatusCode::METHOD_NOT_ALLOWED)
            }
            WebSocketError::BadHandshake(HandshakeError::Version) => Response::builder()
                .status(StatusCode::UPGRADE_REQUIRED)
                .header(header::SEC_WEBSOCKET_VERSION, handshake::WEBSOCKET_VERSION),
            _ => Response::builder().status(StatusCode::BAD_REQUEST),
        };

        response
            .body(Empty::new())
            .expect("bug: failed to build rejection response")
    }
}

/// Future that completes the protocol switch and yields the connection.
///
/// The associated 101 response must be sent to the client first; the future
/// stays pending until hyper hands over the raw stream.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
    negotiation: Option<Negotiation>,
}

impl Future for UpgradeFut {
    type Output = Result<WebSocket<UpgradedStream>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(upgraded)) => upgraded,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
        };

        let negotiation = this
            .negotiation
            .take()
            .expect("upgrade future polled after completion");

        Poll::Ready(Ok(WebSocket::new(
            Role::Server,
            TokioIo::new(upgraded),
            negotiation,
        )))
    }
}
