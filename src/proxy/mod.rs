//! SOCKS5 protocol handling and the byte relay.
//!
//! Wire parsing lives in [`socks5`], the outbound dial decision in
//! [`connector`], and the per-direction buffering in [`relay`]. Streams are
//! abstracted behind [`stream::ProxyStream`] so sessions can be driven by
//! sockets or by the in-memory pair in [`memory`].

pub mod connector;
pub mod memory;
pub mod relay;
pub mod socks5;
pub mod stream;
pub mod tls;

pub use connector::{Connector, DialPolicy, Dialer, NetDialer, Resolver, SystemResolver};
pub use relay::{Relay, RelayBuffer};
pub use stream::{ProxyStream, RemoteStream, TcpProxyStream};
