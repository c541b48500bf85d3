//! Client-side handshake: TCP/TLS dial, upgrade request construction, and
//! response verification.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use http_body_util::Empty;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{
    conn::{Negotiation, Options, Role, WebSocket},
    extension::{self, DeflateOffer},
    handshake,
    server::UpgradedStream,
    stream::MaybeTlsStream,
    HandshakeError, Result, WebSocketError,
};

/// Builder for the client's upgrade request, re-exported so extra headers
/// can be attached before the dial.
pub type HttpRequestBuilder = hyper::http::request::Builder;

/// Supplies `Cookie` header values for the handshake request, e.g. session
/// tokens kept by the application.
pub trait CookieProvider: Send + Sync {
    /// The `Cookie` header value to attach when dialing `url`, if any.
    fn cookies(&self, url: &Url) -> Option<header::HeaderValue>;
}

/// Headers the engine owns; a user-supplied request must not set them.
const RESERVED_HEADERS: [header::HeaderName; 6] = [
    header::UPGRADE,
    header::CONNECTION,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_PROTOCOL,
];

/// Future returned by [`WebSocket::connect`]; configure it before awaiting.
///
/// ```no_run
/// use riptide::{Options, WebSocket};
///
/// # async fn run() -> riptide::Result<()> {
/// let ws = WebSocket::connect("wss://example.com/feed".parse()?)
///     .with_options(Options::default().with_subprotocols(["chat"]))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct WebSocketBuilder {
    opts: Option<DialOpts>,
    future: Option<BoxFuture<'static, Result<WebSocket<UpgradedStream>>>>,
}

struct DialOpts {
    url: Url,
    tcp_address: Option<SocketAddr>,
    connector: Option<TlsConnector>,
    options: Option<Options>,
    http_builder: Option<HttpRequestBuilder>,
    cookie_jar: Option<Arc<dyn CookieProvider>>,
}

impl WebSocketBuilder {
    fn new(url: Url) -> Self {
        Self {
            opts: Some(DialOpts {
                url,
                tcp_address: None,
                connector: None,
                options: None,
                http_builder: None,
                cookie_jar: None,
            }),
            future: None,
        }
    }

    fn opts_mut(&mut self) -> &mut DialOpts {
        self.opts.as_mut().expect("builder configured after polling")
    }

    /// Connection options: read buffer, size caps, subprotocols,
    /// compression.
    pub fn with_options(mut self, options: Options) -> Self {
        self.opts_mut().options = Some(options);
        self
    }

    /// Custom TLS configuration for `wss://` URLs. Without this, a rustls
    /// connector over the webpki root store is used.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.opts_mut().connector = Some(connector);
        self
    }

    /// Dials this address instead of resolving the URL's host, while the
    /// URL still provides the `Host` header and TLS identity.
    pub fn with_tcp_address(mut self, address: SocketAddr) -> Self {
        self.opts_mut().tcp_address = Some(address);
        self
    }

    /// Extra headers for the upgrade request (authorization, user-agent,
    /// a custom `Host`). Reserved WebSocket headers fail the dial with
    /// [`WebSocketError::DuplicateHeaders`].
    pub fn with_request(mut self, builder: HttpRequestBuilder) -> Self {
        self.opts_mut().http_builder = Some(builder);
        self
    }

    /// Attaches a cookie source consulted for the dial URL.
    pub fn with_cookie_jar(mut self, jar: Arc<dyn CookieProvider>) -> Self {
        self.opts_mut().cookie_jar = Some(jar);
        self
    }
}

impl Future for WebSocketBuilder {
    type Output = Result<WebSocket<UpgradedStream>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(opts) = this.opts.take() {
            this.future = Some(Box::pin(connect(opts)));
        }

        match &mut this.future {
            Some(future) => future.poll_unpin(cx),
            None => Poll::Pending,
        }
    }
}

impl WebSocket<UpgradedStream> {
    /// Starts a connection to a `ws://` or `wss://` URL.
    ///
    /// The returned builder is a future; await it directly for default
    /// behavior or chain configuration first. See [`WebSocketBuilder`].
    pub fn connect(url: Url) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    /// Performs the client handshake over an already-connected stream,
    /// bypassing the dial. Useful for proxied or pre-established
    /// transports.
    pub async fn handshake<S>(url: Url, io: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        handshake_with_request(url, io, options, Request::builder(), None).await
    }
}

async fn connect(opts: DialOpts) -> Result<WebSocket<UpgradedStream>> {
    let DialOpts {
        url,
        tcp_address,
        connector,
        options,
        http_builder,
        cookie_jar,
    } = opts;

    // Credentials in the authority are not part of the WebSocket URL
    // grammar.
    if !url.username().is_empty() || url.password().is_some() {
        return Err(WebSocketError::BadUrl);
    }
    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        _ => return Err(WebSocketError::BadUrl),
    };

    let host = url.host_str().ok_or(WebSocketError::BadUrl)?.to_owned();
    let port = url.port_or_known_default().ok_or(WebSocketError::BadUrl)?;

    let tcp_stream = match tcp_address {
        Some(address) => TcpStream::connect(address).await?,
        None => TcpStream::connect((host.as_str(), port)).await?,
    };

    let stream = if secure {
        let connector = connector.unwrap_or_else(default_tls_connector);
        let domain = ServerName::try_from(host)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dns name"))?;
        MaybeTlsStream::Tls(connector.connect(domain, tcp_stream).await?)
    } else {
        MaybeTlsStream::Plain(tcp_stream)
    };

    handshake_with_request(
        url,
        stream,
        options.unwrap_or_default(),
        http_builder.unwrap_or_else(Request::builder),
        cookie_jar,
    )
    .await
}

async fn handshake_with_request<S>(
    url: Url,
    io: S,
    options: Options,
    mut builder: HttpRequestBuilder,
    cookie_jar: Option<Arc<dyn CookieProvider>>,
) -> Result<WebSocket<UpgradedStream>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let user_headers = builder.headers_ref().ok_or(WebSocketError::BadUrl)?;
    check_reserved_headers(user_headers)?;

    // The caller may override Host; fill it from the URL otherwise, with
    // the port only when the URL spells one out.
    if !user_headers.contains_key(header::HOST) {
        let host = url.host_str().ok_or(WebSocketError::BadUrl)?;
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        builder = builder.header(header::HOST, host_header);
    }

    let key = handshake::generate_key();
    let target = &url[url::Position::BeforePath..];

    let mut request = builder
        .method("GET")
        .uri(target)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key.as_str())
        .header(header::SEC_WEBSOCKET_VERSION, handshake::WEBSOCKET_VERSION)
        .body(Empty::<Bytes>::new())
        .expect("bug: failed to build upgrade request");

    if !options.subprotocols.is_empty() {
        let joined = options.subprotocols.join(", ");
        if let Ok(value) = joined.parse() {
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    if let Some(compression) = options.compression.as_ref() {
        let offer = DeflateOffer {
            client_no_context_takeover: !compression.context_takeover,
            server_no_context_takeover: false,
        };
        if let Ok(value) = offer.to_string().parse() {
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_EXTENSIONS, value);
        }
    }

    if let Some(jar) = cookie_jar {
        if let Some(cookies) = jar.cookies(&url) {
            request.headers_mut().insert(header::COOKIE, cookies);
        }
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(_err) = conn.with_upgrades().await {
            #[cfg(feature = "logging")]
            log::error!("http connection during upgrade: {_err:?}");
        }
    });

    let mut response = sender.send_request(request).await?;
    let negotiation = verify(&response, &options, &key)?;

    let upgraded = hyper::upgrade::on(&mut response).await?;

    Ok(WebSocket::new(
        Role::Client,
        TokioIo::new(upgraded),
        negotiation,
    ))
}

fn check_reserved_headers(headers: &header::HeaderMap) -> Result<()> {
    if RESERVED_HEADERS.iter().any(|name| headers.contains_key(name)) {
        return Err(WebSocketError::DuplicateHeaders);
    }
    Ok(())
}

/// Validates the server's 101 response and derives the negotiated
/// connection parameters.
fn verify<B>(response: &Response<B>, options: &Options, key: &str) -> Result<Negotiation> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(HandshakeError::Status(response.status().as_u16()).into());
    }

    let headers = response.headers();

    // A version header in the response means the server rejected ours.
    if headers.contains_key(header::SEC_WEBSOCKET_VERSION) {
        return Err(HandshakeError::Version.into());
    }

    if !handshake::header_contains_token(headers, header::UPGRADE, "websocket") {
        return Err(HandshakeError::UpgradeHeader.into());
    }
    if !handshake::header_contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(HandshakeError::ConnectionHeader.into());
    }

    let accepted = headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == handshake::accept_key(key.as_bytes()))
        .unwrap_or(false);
    if !accepted {
        return Err(HandshakeError::Accept.into());
    }

    let subprotocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if !subprotocol.is_empty() && options.subprotocols.is_empty() {
        return Err(HandshakeError::Subprotocol.into());
    }

    let extension_values = || {
        headers
            .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
            .iter()
            .filter_map(|value| value.to_str().ok())
    };

    let offer = if options.compression.is_some() {
        extension::parse_ack(extension_values()).map_err(|()| HandshakeError::Extensions)?
    } else {
        // Nothing was offered, so nothing may come back.
        if extension_values().any(|value| !value.trim().is_empty()) {
            return Err(HandshakeError::Extensions.into());
        }
        None
    };

    #[cfg(feature = "logging")]
    if let Some(offer) = &offer {
        log::debug!(
            "server accepted permessage-deflate, no_takeover={}",
            offer.no_takeover()
        );
    }

    Ok(Negotiation::new(options, subprotocol, offer))
}

/// TLS connector over the bundled webpki roots, with the process crypto
/// provider (ring as the fallback) and HTTP/1.1 ALPN.
fn default_tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .expect("bug: provider rejects stock protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsConnector::from(Arc::new(config))
}
