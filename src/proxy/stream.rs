//! Non-blocking byte streams as seen by the session state machine.
//!
//! Sessions are driven one scheduler pass at a time, so every stream
//! operation here completes immediately: a read hands back whatever is
//! already buffered by the transport (possibly nothing), a write hands back
//! how much the transport accepted. End-of-stream is not reported through
//! the read count; it shows up as [`ProxyStream::is_connected`] turning false.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

/// A half-duplex pair of byte pipes owned by a session.
pub trait ProxyStream: Send {
    /// Read bytes that are available right now into `buf`.
    ///
    /// `Ok(0)` means nothing is pending. Errors also mark the stream as
    /// disconnected.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the transport accepts without waiting.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the peer may still send or receive data.
    fn is_connected(&self) -> bool;

    /// Close the stream. Idempotent.
    fn close(&mut self);

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Plain TCP stream backed by a tokio socket.
///
/// Uses `try_read`/`try_write`, which consult the readiness the runtime has
/// already observed, so the scheduler has to yield to the runtime between
/// passes for new data to show up.
pub struct TcpProxyStream {
    inner: Option<TcpStream>,
    peer: Option<SocketAddr>,
    eof: bool,
}

impl TcpProxyStream {
    /// Wrap a connected socket.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            inner: Some(stream),
            peer,
            eof: false,
        }
    }
}

impl ProxyStream for TcpProxyStream {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = &self.inner else {
            return Ok(0);
        };
        if buf.is_empty() || self.eof {
            return Ok(0);
        }

        match stream.try_read(buf) {
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(stream) = &self.inner else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if buf.is_empty() {
            return Ok(0);
        }

        match stream.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.is_some() && !self.eof
    }

    fn close(&mut self) {
        // Dropping the socket closes it
        self.inner = None;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// The dialed leg of a session. Chosen once, when the target is dialed.
pub enum RemoteStream {
    /// Plain TCP
    Plain(Box<dyn ProxyStream>),
    /// TLS client stream (certificates not verified)
    Encrypted(Box<dyn ProxyStream>),
}

impl RemoteStream {
    /// Whether this is the TLS variant.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, RemoteStream::Encrypted(_))
    }

    fn inner(&self) -> &dyn ProxyStream {
        match self {
            RemoteStream::Plain(s) | RemoteStream::Encrypted(s) => s.as_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ProxyStream {
        match self {
            RemoteStream::Plain(s) | RemoteStream::Encrypted(s) => s.as_mut(),
        }
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_encrypted() { "Encrypted" } else { "Plain" };
        f.debug_struct("RemoteStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ProxyStream for RemoteStream {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut().read_available(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_mut().write_some(buf)
    }

    fn is_connected(&self) -> bool {
        self.inner().is_connected()
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner().peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::memory::MemoryStream;

    #[test]
    fn test_remote_stream_delegates() {
        let (stream, peer) = MemoryStream::pair();
        let mut remote = RemoteStream::Encrypted(Box::new(stream));
        assert!(remote.is_encrypted());

        peer.send(b"abc");
        let mut buf = [0u8; 8];
        assert_eq!(remote.read_available(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        remote.close();
        assert!(!remote.is_connected());
        assert!(peer.is_closed_by_stream());
    }

    #[tokio::test]
    async fn test_tcp_stream_reports_eof() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let mut stream = TcpProxyStream::new(accepted);

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        for _ in 0..200 {
            let n = stream.read_available(&mut buf).unwrap_or(0);
            received.extend_from_slice(&buf[..n]);
            if !stream.is_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(received, b"ping");
        assert!(!stream.is_connected());
    }
}
