//! Opening-handshake primitives shared by the client and server sides:
//! challenge key generation and proof, token-based header matching, the
//! default origin policy, and subprotocol selection.

use base64::prelude::*;
use hyper::header::{HeaderMap, HeaderName};
use sha1::{Digest, Sha1};
use url::Url;

/// Fixed GUID the accept hash is salted with (RFC 6455 Section 1.3).
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this engine speaks.
pub(crate) const WEBSOCKET_VERSION: &str = "13";

/// Generates a fresh 16-byte challenge key, base64-encoded, for a client
/// handshake request.
pub(crate) fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Derives the `Sec-WebSocket-Accept` value proving the peer understood the
/// upgrade: `base64(SHA1(key || GUID))`.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A challenge key is valid iff it base64-decodes to exactly 16 bytes.
pub(crate) fn valid_key(key: &str) -> bool {
    matches!(BASE64_STANDARD.decode(key), Ok(decoded) if decoded.len() == 16)
}

/// Checks whether any occurrence of `name` contains `token` as a
/// comma-separated member, case-insensitively.
///
/// `Connection: keep-alive, Upgrade` therefore matches the token `upgrade`.
pub(crate) fn header_contains_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|value| {
                value
                    .split(',')
                    .any(|member| member.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

/// Default origin policy: a request with no `Origin` header is accepted
/// (non-browser clients don't send one); otherwise the origin URL's
/// authority must equal the `Host` header.
pub(crate) fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(hyper::header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Ok(origin) = Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = origin.host_str() else {
        return false;
    };

    let authority = match origin.port() {
        Some(port) => format!("{origin_host}:{port}"),
        None => origin_host.to_owned(),
    };

    headers
        .get(hyper::header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(|host| host.eq_ignore_ascii_case(&authority))
        .unwrap_or(false)
}

/// Selects the subprotocol: first match over the server's preference list
/// against the client's `Sec-WebSocket-Protocol` tokens. No match means no
/// header in the response.
pub(crate) fn select_subprotocol(headers: &HeaderMap, preferences: &[String]) -> Option<String> {
    let offered: Vec<&str> = headers
        .get_all(hyper::header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();

    preferences
        .iter()
        .find(|preference| offered.contains(&preference.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{self, HeaderValue};

    #[test]
    fn test_accept_key_rfc_vector() {
        // The worked example from RFC 6455 Section 1.3.
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_keys_are_valid() {
        for _ in 0..8 {
            let key = generate_key();
            assert!(valid_key(&key), "{key} must decode to 16 bytes");
        }
    }

    #[test]
    fn test_valid_key() {
        assert!(valid_key("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(!valid_key(""));
        assert!(!valid_key("not base64!!"));
        // Valid base64, wrong length.
        assert!(!valid_key(&BASE64_STANDARD.encode(b"short")));
    }

    #[test]
    fn test_header_token_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(header_contains_token(&headers, header::CONNECTION, "upgrade"));
        assert!(header_contains_token(&headers, header::CONNECTION, "keep-alive"));
        assert!(!header_contains_token(&headers, header::CONNECTION, "websocket"));
        assert!(!header_contains_token(&headers, header::UPGRADE, "websocket"));

        // Case-insensitive on both sides.
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(header_contains_token(&headers, header::UPGRADE, "websocket"));
    }

    #[test]
    fn test_token_matching_across_occurrences() {
        let mut headers = HeaderMap::new();
        headers.append(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.append(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(header_contains_token(&headers, header::CONNECTION, "upgrade"));
    }

    #[test]
    fn test_same_origin_no_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        assert!(same_origin(&headers));
    }

    #[test]
    fn test_same_origin_match() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://example.com"));
        assert!(same_origin(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert!(!same_origin(&headers));
    }

    #[test]
    fn test_same_origin_with_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com:8080"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://example.com:8080"));
        assert!(same_origin(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://example.com:9090"));
        assert!(!same_origin(&headers));
    }

    #[test]
    fn test_same_origin_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("not a url"));
        assert!(!same_origin(&headers));
    }

    #[test]
    fn test_subprotocol_server_preference_order() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("chat, superchat"),
        );

        // The server's list decides, not the client's ordering.
        let preferences = vec!["superchat".to_owned(), "chat".to_owned()];
        assert_eq!(
            select_subprotocol(&headers, &preferences),
            Some("superchat".to_owned())
        );
    }

    #[test]
    fn test_subprotocol_no_match() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("graphql-ws"));
        assert_eq!(select_subprotocol(&headers, &["chat".to_owned()]), None);
        assert_eq!(select_subprotocol(&HeaderMap::new(), &["chat".to_owned()]), None);
    }
}
