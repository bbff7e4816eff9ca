//! SOCKS5 wire format (RFC 1928 subset).
//!
//! Only the pieces this proxy speaks: the no-auth method selection, the
//! CONNECT request with IPv4 or domain-name targets, and the fixed 10-byte
//! IPv4 reply. Parsing works over the raw handshake buffer and never keeps
//! state between calls; a short buffer yields [`Parsed::Incomplete`].

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

/// Protocol version byte
pub const VERSION: u8 = 0x05;

/// Minimum greeting: version, nmethods, one method
pub const GREETING_MIN_LEN: usize = 3;

/// Largest request we accept: header, length byte, 255-byte name, port
pub const MAX_REQUEST_LEN: usize = 4 + 1 + 255 + 2;

/// "No authentication required"
pub const METHOD_NO_AUTH: u8 = 0x00;
/// "No acceptable methods"
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Length of every reply we send
pub const REPLY_LEN: usize = 10;

/// Reply codes used by this proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Outcome of parsing a message from the front of the raw buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<T> {
    /// More bytes are needed
    Incomplete,
    /// A full message was parsed from the first `consumed` bytes
    Complete { value: T, consumed: usize },
}

/// Destination named in a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    /// Hostname to resolve before dialing
    Domain(String),
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub addr: TargetAddr,
    pub port: u16,
}

/// Check the greeting at the front of `buf` for the no-auth method.
///
/// Returns the number of bytes the greeting occupies once the full method
/// list has arrived.
pub fn parse_greeting(buf: &[u8]) -> Result<Parsed<()>> {
    if buf.len() < GREETING_MIN_LEN {
        return Ok(Parsed::Incomplete);
    }

    if buf[0] != VERSION {
        return Err(Error::BadVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    let consumed = 2 + nmethods;
    if buf.len() < consumed {
        return Ok(Parsed::Incomplete);
    }

    if buf[2..consumed].contains(&METHOD_NO_AUTH) {
        Ok(Parsed::Complete {
            value: (),
            consumed,
        })
    } else {
        Err(Error::NoAcceptableMethod)
    }
}

/// Parse a CONNECT request at the front of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<Parsed<ConnectRequest>> {
    if buf.len() < 3 {
        return Ok(Parsed::Incomplete);
    }

    if buf[0] != VERSION {
        return Err(Error::BadVersion(buf[0]));
    }

    if buf[1] != CMD_CONNECT {
        return Err(Error::UnsupportedCommand(buf[1]));
    }

    // buf[2] is reserved
    if buf.len() < 4 {
        return Ok(Parsed::Incomplete);
    }

    match buf[3] {
        ATYP_IPV4 => {
            if buf.len() < 4 + 4 + 2 {
                return Ok(Parsed::Incomplete);
            }
            let addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            Ok(Parsed::Complete {
                value: ConnectRequest {
                    addr: TargetAddr::Ipv4(addr),
                    port,
                },
                consumed: 10,
            })
        }
        ATYP_DOMAIN => {
            if buf.len() < 4 + 2 {
                return Ok(Parsed::Incomplete);
            }
            let len = buf[4] as usize;
            let consumed = 5 + len + 2;
            if buf.len() < consumed {
                return Ok(Parsed::Incomplete);
            }

            let name = &buf[5..5 + len];
            let hostname = String::from_utf8(name.to_vec())
                .map_err(|_| Error::Resolve(String::from_utf8_lossy(name).into_owned()))?;
            let port = u16::from_be_bytes([buf[5 + len], buf[5 + len + 1]]);

            Ok(Parsed::Complete {
                value: ConnectRequest {
                    addr: TargetAddr::Domain(hostname),
                    port,
                },
                consumed,
            })
        }
        other => Err(Error::UnsupportedAddressType(other)),
    }
}

/// Method selection reply.
pub fn method_reply(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// Encode a reply carrying an IPv4 address and port.
pub fn encode_reply(reply: Reply, addr: SocketAddrV4) -> [u8; REPLY_LEN] {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    [
        VERSION,
        reply as u8,
        0x00,
        ATYP_IPV4,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}

/// Encode a failure reply with an all-zero bound address.
pub fn failure_reply(reply: Reply) -> [u8; REPLY_LEN] {
    encode_reply(reply, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_accepts_no_auth_among_others() {
        let parsed = parse_greeting(&[0x05, 0x02, 0x02, 0x00]).unwrap();
        assert_eq!(
            parsed,
            Parsed::Complete {
                value: (),
                consumed: 4
            }
        );
    }

    #[test]
    fn test_greeting_rejects_auth_only() {
        let err = parse_greeting(&[0x05, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, Error::NoAcceptableMethod));
    }

    #[test]
    fn test_greeting_zero_methods() {
        let err = parse_greeting(&[0x05, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::NoAcceptableMethod));
    }

    #[test]
    fn test_greeting_bad_version() {
        let err = parse_greeting(&[0x04, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BadVersion(0x04)));
    }

    #[test]
    fn test_greeting_waits_for_method_list() {
        assert_eq!(parse_greeting(&[0x05, 0x03, 0x02]).unwrap(), Parsed::Incomplete);
        assert_eq!(parse_greeting(&[0x05]).unwrap(), Parsed::Incomplete);
    }

    #[test]
    fn test_request_ipv4() {
        let buf = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];
        let parsed = parse_request(&buf).unwrap();
        assert_eq!(
            parsed,
            Parsed::Complete {
                value: ConnectRequest {
                    addr: TargetAddr::Ipv4(Ipv4Addr::new(93, 184, 216, 34)),
                    port: 80,
                },
                consumed: 10,
            }
        );
    }

    #[test]
    fn test_request_ipv4_incomplete() {
        let buf = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00];
        assert_eq!(parse_request(&buf).unwrap(), Parsed::Incomplete);
    }

    #[test]
    fn test_request_domain() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());

        match parse_request(&buf).unwrap() {
            Parsed::Complete { value, consumed } => {
                assert_eq!(value.addr, TargetAddr::Domain("example.com".into()));
                assert_eq!(value.port, 443);
                assert_eq!(consumed, buf.len());
            }
            Parsed::Incomplete => panic!("request should be complete"),
        }

        // Every strict prefix waits for more input
        for cut in 0..buf.len() {
            assert_eq!(parse_request(&buf[..cut]).unwrap(), Parsed::Incomplete);
        }
    }

    #[test]
    fn test_request_ipv6_rejected() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x04];
        buf.extend_from_slice(&[0u8; 18]);
        let err = parse_request(&buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddressType(0x04)));

        // Rejected before the address arrives too
        let err = parse_request(&[0x05, 0x01, 0x00, 0x04]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddressType(0x04)));
    }

    #[test]
    fn test_request_bind_rejected() {
        let err = parse_request(&[0x05, 0x02, 0x00]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCommand(0x02)));
    }

    #[test]
    fn test_request_invalid_utf8_hostname() {
        let buf = [0x05, 0x01, 0x00, 0x03, 2, 0xff, 0xfe, 0x00, 0x50];
        let err = parse_request(&buf).unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }

    #[test]
    fn test_encode_reply() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);
        assert_eq!(
            encode_reply(Reply::Success, addr),
            [0x05, 0x00, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50]
        );
        assert_eq!(
            failure_reply(Reply::AddressTypeNotSupported),
            [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }
}
