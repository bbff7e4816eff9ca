//! In-memory stream pair for driving sessions without sockets.
//!
//! The [`MemoryStream`] half is handed to the proxy; the [`MemoryPeer`] half
//! plays the client or target. Writes into the stream can be throttled with a
//! byte budget to model a slow consumer.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::stream::ProxyStream;

#[derive(Default)]
struct Shared {
    /// Bytes sent by the peer, not yet read by the stream
    pending: VecDeque<u8>,
    /// Bytes written by the stream, not yet taken by the peer
    received: Vec<u8>,
    /// Bytes the stream may still write; `None` is unlimited
    write_budget: Option<usize>,
    peer_closed: bool,
    stream_closed: bool,
}

/// Proxy-side half of an in-memory connection.
pub struct MemoryStream {
    shared: Arc<Mutex<Shared>>,
    peer_addr: Option<SocketAddr>,
}

/// Test-side half of an in-memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStream {
    /// Create a connected pair.
    pub fn pair() -> (MemoryStream, MemoryPeer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            MemoryStream {
                shared: Arc::clone(&shared),
                peer_addr: None,
            },
            MemoryPeer { shared },
        )
    }

    /// Attach a peer address, reported through [`ProxyStream::peer_addr`].
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }
}

impl ProxyStream for MemoryStream {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        if shared.stream_closed {
            return Ok(0);
        }
        let n = buf.len().min(shared.pending.len());
        for (slot, byte) in buf.iter_mut().zip(shared.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        if shared.stream_closed || shared.peer_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match shared.write_budget {
            Some(budget) => buf.len().min(budget),
            None => buf.len(),
        };
        if let Some(budget) = shared.write_budget.as_mut() {
            *budget -= n;
        }
        shared.received.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        let shared = self.shared.lock();
        // Unread data keeps a half-closed peer readable
        !shared.stream_closed && !(shared.peer_closed && shared.pending.is_empty())
    }

    fn close(&mut self) {
        self.shared.lock().stream_closed = true;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl MemoryPeer {
    /// Queue bytes for the stream to read.
    pub fn send(&self, data: &[u8]) {
        self.shared.lock().pending.extend(data.iter().copied());
    }

    /// Take everything the stream has written so far.
    pub fn take_received(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().received)
    }

    /// Bytes sent by this peer that the stream has not read yet.
    pub fn unread(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Limit how many more bytes the stream may write. `None` lifts the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.shared.lock().write_budget = budget;
    }

    /// Hang up from the peer side.
    pub fn close(&self) {
        self.shared.lock().peer_closed = true;
    }

    /// Whether the proxy closed its half.
    pub fn is_closed_by_stream(&self) -> bool {
        self.shared.lock().stream_closed
    }
}
