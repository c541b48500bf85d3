//! `Sec-WebSocket-Extensions` negotiation for permessage-deflate
//! ([RFC 7692 Section 7.1](https://datatracker.ietf.org/doc/html/rfc7692#section-7.1)).
//!
//! A header value is a comma-separated list of offers, each an extension
//! name followed by `;`-separated parameters. The negotiator walks the
//! offers in order and takes the first permessage-deflate offer whose every
//! parameter it understands; an offer with any unrecognized parameter is
//! skipped and the next one tried.

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0},
    combinator::opt,
    sequence::{delimited, pair, preceded},
    IResult,
};

pub(crate) const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Takeover flags carried by a permessage-deflate offer or acknowledgment.
///
/// `server_max_window_bits=15` and `client_max_window_bits` (bare or with
/// any value) are accepted during parsing but carry no state: the DEFLATE
/// window is fixed at 32 KiB and cannot be narrowed, so the only negotiable
/// knobs are the takeover flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DeflateOffer {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl DeflateOffer {
    /// Whether either side asked for the shared context to be dropped
    /// between messages.
    pub(crate) fn no_takeover(&self) -> bool {
        self.server_no_context_takeover || self.client_no_context_takeover
    }

    /// The acknowledgment advertised when the connection ends up without
    /// context takeover; both directions reset, so both flags are declared.
    pub(crate) fn without_takeover() -> Self {
        Self {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
        }
    }
}

impl fmt::Display for DeflateOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PERMESSAGE_DEFLATE)?;
        if self.server_no_context_takeover {
            f.write_str("; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            f.write_str("; client_no_context_takeover")?;
        }
        Ok(())
    }
}

/// Scans the offers across all `Sec-WebSocket-Extensions` header values and
/// returns the first acceptable permessage-deflate offer, if any.
pub(crate) fn accept_offer<'a>(values: impl Iterator<Item = &'a str>) -> Option<DeflateOffer> {
    for value in values {
        for offer in value.split(',') {
            if let Ok(offer) = parse_offer(offer) {
                return Some(offer);
            }
        }
    }
    None
}

/// Parses a server's extension acknowledgment on the client side.
///
/// The server may acknowledge at most the one extension that was offered;
/// anything else in the header fails the handshake.
pub(crate) fn parse_ack<'a>(
    values: impl Iterator<Item = &'a str>,
) -> Result<Option<DeflateOffer>, ()> {
    let mut ack = None;
    for value in values {
        for offer in value.split(',') {
            if offer.trim().is_empty() {
                continue;
            }
            let parsed = parse_offer(offer)?;
            if ack.replace(parsed).is_some() {
                return Err(());
            }
        }
    }
    Ok(ack)
}

/// Parses a single offer. `Err(())` means this offer is not an acceptable
/// permessage-deflate offer (wrong name, unrecognized parameter, or a window
/// size this engine cannot honor).
fn parse_offer(input: &str) -> Result<DeflateOffer, ()> {
    let input = input.trim_end();
    let (mut rest, _) = offer_name(input).map_err(|_| ())?;

    let mut offer = DeflateOffer::default();
    while !rest.is_empty() {
        let (next, (key, value)) = offer_param(rest).map_err(|_| ())?;
        match (key, value) {
            ("client_no_context_takeover", None) => offer.client_no_context_takeover = true,
            ("server_no_context_takeover", None) => offer.server_no_context_takeover = true,
            // The window cannot be narrowed; only the full 15 bits are
            // acceptable for the server direction.
            ("server_max_window_bits", Some("15")) => {}
            // Harmless for the client direction, whatever the value: a
            // narrower client window still inflates fine in 32 KiB.
            ("client_max_window_bits", _) => {}
            _ => return Err(()),
        }
        rest = next;
    }

    Ok(offer)
}

fn offer_name(input: &str) -> IResult<&str, &str> {
    preceded(space0, tag(PERMESSAGE_DEFLATE))(input)
}

/// One `; key` or `; key=value` parameter; values may be bare digits or a
/// quoted digit string.
fn offer_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        pair(space0, char(';')),
        preceded(
            space0,
            pair(
                take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                opt(preceded(
                    char('='),
                    alt((digit1, delimited(char('"'), digit1, char('"')))),
                )),
            ),
        ),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_offer() {
        let offer = parse_offer("permessage-deflate").unwrap();
        assert_eq!(offer, DeflateOffer::default());
    }

    #[test]
    fn test_flags() {
        let offer = parse_offer(
            "permessage-deflate; client_no_context_takeover; server_no_context_takeover",
        )
        .unwrap();
        assert!(offer.client_no_context_takeover);
        assert!(offer.server_no_context_takeover);
        assert!(offer.no_takeover());
    }

    #[test]
    fn test_window_bits_rules() {
        // server_max_window_bits only with the full window.
        assert!(parse_offer("permessage-deflate; server_max_window_bits=15").is_ok());
        assert!(parse_offer("permessage-deflate; server_max_window_bits=10").is_err());
        assert!(parse_offer("permessage-deflate; server_max_window_bits").is_err());

        // client_max_window_bits bare or with any value.
        assert!(parse_offer("permessage-deflate; client_max_window_bits").is_ok());
        assert!(parse_offer("permessage-deflate; client_max_window_bits=8").is_ok());
        assert!(parse_offer("permessage-deflate; client_max_window_bits=\"15\"").is_ok());
    }

    #[test]
    fn test_unknown_parameter_skips_offer() {
        assert!(parse_offer("permessage-deflate; foo").is_err());
        assert!(parse_offer("permessage-deflate; client_no_context_takeover=1").is_err());
        assert!(parse_offer("x-webkit-deflate-frame").is_err());
        assert!(parse_offer("permessage-deflate; client_no_context_takeover; bar=2").is_err());
    }

    #[test]
    fn test_first_acceptable_offer_wins() {
        let header = "permessage-deflate; mystery_param, \
                      permessage-deflate; server_no_context_takeover, \
                      permessage-deflate";
        let offer = accept_offer([header].into_iter()).unwrap();
        assert!(offer.server_no_context_takeover);
        assert!(!offer.client_no_context_takeover);
    }

    #[test]
    fn test_offers_across_header_values() {
        let values = ["x-unknown-extension", "permessage-deflate; client_max_window_bits"];
        assert!(accept_offer(values.into_iter()).is_some());
    }

    #[test]
    fn test_no_acceptable_offer() {
        assert!(accept_offer(["x-unknown-extension"].into_iter()).is_none());
        assert!(accept_offer(std::iter::empty()).is_none());
    }

    #[test]
    fn test_ack_parsing() {
        assert_eq!(parse_ack(std::iter::empty()).unwrap(), None);

        let ack = parse_ack(["permessage-deflate; server_no_context_takeover"].into_iter())
            .unwrap()
            .unwrap();
        assert!(ack.server_no_context_takeover);

        // Anything but the single offered extension fails.
        assert!(parse_ack(["x-unknown-extension"].into_iter()).is_err());
        assert!(parse_ack(["permessage-deflate, permessage-deflate"].into_iter()).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(DeflateOffer::default().to_string(), "permessage-deflate");
        assert_eq!(
            DeflateOffer::without_takeover().to_string(),
            "permessage-deflate; server_no_context_takeover; client_no_context_takeover"
        );
        let client_offer = DeflateOffer {
            client_no_context_takeover: true,
            server_no_context_takeover: false,
        };
        assert_eq!(
            client_offer.to_string(),
            "permessage-deflate; client_no_context_takeover"
        );
    }
}
