//! Close status codes as defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).

/// Status code carried in the first two bytes of a close frame payload.
///
/// Only a subset of the numeric space is valid on the wire. The engine emits
/// `Normal`, `Away`, `Protocol`, `Invalid`, `Size` and `Error`; everything in
/// the table can be received. Codes in the `4000..=4999` range (and the IANA
/// `3000..=3999` range) pass through as opaque application codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, normal closure.
    Normal,
    /// 1001, the endpoint is going away.
    Away,
    /// 1002, protocol error.
    Protocol,
    /// 1003, received a data type it cannot accept.
    Unsupported,
    /// 1004, reserved.
    Reserved,
    /// 1005, no status code present. Must never appear on the wire.
    Status,
    /// 1006, abnormal closure. Must never appear on the wire.
    Abnormal,
    /// 1007, payload data inconsistent with the message type (e.g. non-UTF-8
    /// text).
    Invalid,
    /// 1008, message violates the endpoint's policy.
    Policy,
    /// 1009, message too big to process.
    Size,
    /// 1010, the client expected an extension the server did not negotiate.
    Extension,
    /// 1011, the server encountered an unexpected condition.
    Error,
    /// 1015, TLS handshake failure. Must never appear on the wire.
    Tls,
    /// Any other code, preserved verbatim.
    Other(u16),
}

impl CloseCode {
    /// Whether the code may legally appear in a close frame on the wire.
    ///
    /// The fixed set 1000-1004 and 1007-1011 is valid; 1005, 1006 and 1015
    /// are sentinels that exist only in APIs; 3000-4999 are accepted as
    /// opaque registered/application codes. Everything else is a protocol
    /// violation.
    pub fn is_allowed(self) -> bool {
        match self {
            CloseCode::Normal
            | CloseCode::Away
            | CloseCode::Protocol
            | CloseCode::Unsupported
            | CloseCode::Reserved
            | CloseCode::Invalid
            | CloseCode::Policy
            | CloseCode::Size
            | CloseCode::Extension
            | CloseCode::Error => true,
            CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls => false,
            CloseCode::Other(code) => (3000..=4999).contains(&code),
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1004 => CloseCode::Reserved,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1015 => CloseCode::Tls,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Reserved => 1004,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Tls => 1015,
            CloseCode::Other(other) => other,
        }
    }
}
