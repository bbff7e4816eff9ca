//! Error types for the SOCKS5 relay.

use thiserror::Error;

use crate::proxy::socks5::Reply;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a proxy session.
#[derive(Error, Debug)]
pub enum Error {
    /// Client spoke something other than SOCKS5
    #[error("unsupported SOCKS version 0x{0:02x}")]
    BadVersion(u8),

    /// Client offered no method we accept
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// Only CONNECT is supported
    #[error("unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// IPv6 and unknown address types
    #[error("unsupported address type 0x{0:02x}")]
    UnsupportedAddressType(u8),

    /// Zero address or zero port in a request
    #[error("bad target address {0}")]
    BadAddress(std::net::SocketAddrV4),

    /// Hostname did not resolve to an IPv4 address
    #[error("could not resolve {0}")]
    Resolve(String),

    /// Outbound connection attempt failed
    #[error("dial {target} failed: {reason}")]
    Dial {
        target: std::net::SocketAddrV4,
        reason: String,
    },

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Every slot is occupied by a live session
    #[error("no free session slot")]
    NoFreeSlot,

    /// A handler ran while the session was in another state
    #[error("session in state {actual} but expected {expected}")]
    Invariant {
        expected: &'static str,
        actual: &'static str,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new dial error
    pub fn dial(target: std::net::SocketAddrV4, reason: impl ToString) -> Self {
        Error::Dial {
            target,
            reason: reason.to_string(),
        }
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// SOCKS reply sent to the client before closing, if any.
    ///
    /// Errors that return `None` close the session silently: the handshake is
    /// either over, never started, or the failure is internal.
    pub fn reply_code(&self) -> Option<Reply> {
        match self {
            Error::BadVersion(_) => Some(Reply::GeneralFailure),
            Error::NoAcceptableMethod => None,
            Error::UnsupportedCommand(_) => Some(Reply::CommandNotSupported),
            Error::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
            Error::BadAddress(_) => Some(Reply::AddressTypeNotSupported),
            Error::Resolve(_) => Some(Reply::AddressTypeNotSupported),
            Error::Dial { .. } | Error::Tls(_) => Some(Reply::ConnectionRefused),
            Error::NoFreeSlot
            | Error::Invariant { .. }
            | Error::Network(_)
            | Error::Config(_) => None,
        }
    }

    /// Check if this error was caused by a malformed or unsupported request
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::BadVersion(_)
                | Error::NoAcceptableMethod
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
                | Error::BadAddress(_)
        )
    }

    /// Check if this error came from reaching the target
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, Error::Resolve(_) | Error::Dial { .. } | Error::Tls(_))
    }
}
