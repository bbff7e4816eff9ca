//! Outbound dial policy and the resolver/dialer seams.
//!
//! The client never says whether its target speaks TLS. The [`DialPolicy`]
//! guesses from the destination port alone: ports in the encrypted set get a
//! TLS client leg, everything else plain TCP. Failures are final; nothing
//! here retries.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::stream::{ProxyStream, RemoteStream, TcpProxyStream};
use super::tls;
use crate::error::{Error, Result};

/// Ports whose traffic is assumed to be TLS.
pub const DEFAULT_ENCRYPTED_PORTS: [u16; 3] = [443, 993, 995];

/// Hostname resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `hostname` to an IPv4 address.
    async fn resolve(&self, hostname: &str) -> Option<Ipv4Addr>;
}

/// Opens the outbound leg.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `target`, wrapping the socket in TLS when `encrypted`.
    async fn dial(&self, target: SocketAddrV4, encrypted: bool) -> Result<Box<dyn ProxyStream>>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Option<Ipv4Addr> {
        if hostname.is_empty() {
            return None;
        }
        let addrs = tokio::net::lookup_host((hostname, 0)).await.ok()?;
        addrs.into_iter().find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
    }
}

/// Dialer for real sockets.
#[derive(Clone)]
pub struct NetDialer {
    tls_config: Arc<ClientConfig>,
}

impl NetDialer {
    /// Create a dialer whose TLS leg skips certificate checks.
    pub fn new() -> Result<Self> {
        Ok(Self {
            tls_config: tls::insecure_client_config()?,
        })
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, target: SocketAddrV4, encrypted: bool) -> Result<Box<dyn ProxyStream>> {
        let tcp = TcpStream::connect(target)
            .await
            .map_err(|e| Error::dial(target, e))?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", target, e);
        }

        if encrypted {
            let stream = tls::handshake(Arc::clone(&self.tls_config), target, tcp).await?;
            Ok(Box::new(stream))
        } else {
            Ok(Box::new(TcpProxyStream::new(tcp)))
        }
    }
}

/// Decides plaintext vs. TLS from the destination port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPolicy {
    encrypted_ports: Vec<u16>,
}

impl DialPolicy {
    /// Create a policy encrypting the given ports.
    pub fn new(encrypted_ports: impl Into<Vec<u16>>) -> Self {
        Self {
            encrypted_ports: encrypted_ports.into(),
        }
    }

    /// Whether a target on `port` gets a TLS leg.
    pub fn is_encrypted(&self, port: u16) -> bool {
        self.encrypted_ports.contains(&port)
    }

    /// Ports in the encrypted set.
    pub fn encrypted_ports(&self) -> &[u16] {
        &self.encrypted_ports
    }
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ENCRYPTED_PORTS)
    }
}

/// Applies the dial policy and bounds each attempt in time.
#[derive(Clone)]
pub struct Connector {
    dialer: Arc<dyn Dialer>,
    policy: DialPolicy,
    timeout: Duration,
}

impl Connector {
    /// Create a connector.
    pub fn new(dialer: Arc<dyn Dialer>, policy: DialPolicy, timeout: Duration) -> Self {
        Self {
            dialer,
            policy,
            timeout,
        }
    }

    /// The policy in use.
    pub fn policy(&self) -> &DialPolicy {
        &self.policy
    }

    /// Dial `target` on a background task.
    ///
    /// The scheduler checks the returned handle on each pass instead of
    /// waiting on it.
    pub fn start(&self, target: SocketAddrV4) -> PendingDial {
        let connector = self.clone();
        PendingDial {
            target,
            handle: tokio::spawn(async move { connector.connect(target).await }),
        }
    }

    /// Dial `target`, choosing the stream variant from its port.
    pub async fn connect(&self, target: SocketAddrV4) -> Result<RemoteStream> {
        if target.ip().is_unspecified() || target.port() == 0 {
            return Err(Error::BadAddress(target));
        }

        let encrypted = self.policy.is_encrypted(target.port());
        let stream = match tokio::time::timeout(self.timeout, self.dialer.dial(target, encrypted))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::dial(
                    target,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                ))
            }
        };

        if encrypted {
            Ok(RemoteStream::Encrypted(stream))
        } else {
            Ok(RemoteStream::Plain(stream))
        }
    }
}

/// A dial in flight. Dropping it abandons the attempt.
pub struct PendingDial {
    target: SocketAddrV4,
    handle: JoinHandle<Result<RemoteStream>>,
}

impl PendingDial {
    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Whether the outcome is ready to take.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Take the outcome. Waits if the dial is still running, so callers
    /// check [`PendingDial::is_finished`] first.
    pub async fn outcome(&mut self) -> Result<RemoteStream> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(Error::dial(self.target, format!("dial task ended: {}", e))),
        }
    }
}

impl Drop for PendingDial {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
