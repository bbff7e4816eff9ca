//! # slotsocks
//!
//! A small SOCKS5 CONNECT proxy built around a fixed pool of session slots
//! and a single cooperative scheduler.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Server (listener + scheduler loop)             │
//! ├─────────────────────────────────────────────────────────┤
//! │   Slot Pool (fixed number of sessions, index order)     │
//! ├─────────────────────────────────────────────────────────┤
//! │   Session (SOCKS5 handshake state machine)              │
//! ├─────────────────────────────────────────────────────────┤
//! │   Relay (bounded buffers, one per direction)            │
//! ├─────────────────────────────────────────────────────────┤
//! │   Connector (plain TCP, or TLS for well-known ports)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Clients speak plaintext SOCKS5 with no authentication. Only CONNECT to an
//! IPv4 address or a hostname is served. The outbound leg is wrapped in TLS
//! when the destination port is one of the configured encrypted ports; the
//! certificate is not verified.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod proxy;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// SOCKS protocol version served
pub const SOCKS_VERSION: u8 = proxy::socks5::VERSION;
