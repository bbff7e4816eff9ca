//! Bidirectional relay between the client and target streams.
//!
//! Each direction owns a [`RelayBuffer`] of fixed capacity. One call to
//! [`Relay::pump`] is one scheduler pass: flush what is buffered, read only
//! as much as fits, then check whether either side has gone away. A full
//! buffer simply stops reads in that direction until the consumer catches up.
//!
//! ```text
//!   client ──read──▶ [ inbound ] ──write──▶ target
//!   client ◀─write── [ outbound ] ◀──read── target
//! ```

use std::io;

use super::stream::ProxyStream;

/// Bounded FIFO byte buffer with a fixed backing allocation.
///
/// Bytes are appended at the back and consumed from the front; a partial
/// consume shifts the remainder down so the free space is always contiguous.
pub struct RelayBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl RelayBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Free space left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Buffered bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Drop the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append as much of `data` as fits; returns the count appended.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Read from `stream` into the free space, never past capacity.
    pub fn fill_from(&mut self, stream: &mut dyn ProxyStream) -> io::Result<usize> {
        if self.is_full() {
            return Ok(0);
        }
        let n = stream.read_available(&mut self.buf[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Write buffered bytes to `stream`, keeping whatever it did not accept.
    pub fn drain_to(&mut self, stream: &mut dyn ProxyStream) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = stream.write_some(self.as_slice())?;
        self.consume(n);
        Ok(n)
    }
}

impl std::fmt::Debug for RelayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Whether the relay should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Open,
    Closed,
}

/// What one pump pass moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Bytes written to the target this pass
    pub to_remote: usize,
    /// Bytes written to the client this pass
    pub to_local: usize,
    pub status: RelayStatus,
}

/// Per-session relay state: one buffer per direction.
#[derive(Debug)]
pub struct Relay {
    /// client → target
    inbound: RelayBuffer,
    /// target → client
    outbound: RelayBuffer,
}

impl Relay {
    /// Create a relay with independent capacities per direction.
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        Self {
            inbound: RelayBuffer::new(inbound_capacity),
            outbound: RelayBuffer::new(outbound_capacity),
        }
    }

    pub fn inbound(&self) -> &RelayBuffer {
        &self.inbound
    }

    pub fn inbound_mut(&mut self) -> &mut RelayBuffer {
        &mut self.inbound
    }

    pub fn outbound(&self) -> &RelayBuffer {
        &self.outbound
    }

    /// Run one relay pass.
    ///
    /// I/O errors are not returned: a failing stream reports itself
    /// disconnected and the liveness check at the end of the pass handles it.
    pub fn pump(
        &mut self,
        local: &mut dyn ProxyStream,
        remote: &mut dyn ProxyStream,
    ) -> PumpReport {
        let mut report = PumpReport {
            to_remote: 0,
            to_local: 0,
            status: RelayStatus::Open,
        };

        // Flush before reading so data that arrived just before a hang-up
        // still goes out.
        report.to_local += drain(&mut self.outbound, local, "client");
        report.to_remote += drain(&mut self.inbound, remote, "target");

        if local.is_connected() {
            fill(&mut self.inbound, local, "client");
        }
        if remote.is_connected() {
            fill(&mut self.outbound, remote, "target");
        }

        if !local.is_connected() {
            report.to_remote += flush_toward(&mut self.inbound, remote);
            if !still_draining(&self.inbound, remote, report.to_remote) {
                remote.close();
                local.close();
                report.status = RelayStatus::Closed;
            }
        } else if !remote.is_connected() {
            report.to_local += flush_toward(&mut self.outbound, local);
            if !still_draining(&self.outbound, local, report.to_local) {
                local.close();
                remote.close();
                report.status = RelayStatus::Closed;
            }
        }

        report
    }
}

fn drain(buffer: &mut RelayBuffer, stream: &mut dyn ProxyStream, side: &str) -> usize {
    match buffer.drain_to(stream) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!("write to {} failed: {}", side, e);
            0
        }
    }
}

fn fill(buffer: &mut RelayBuffer, stream: &mut dyn ProxyStream, side: &str) -> usize {
    match buffer.fill_from(stream) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!("read from {} failed: {}", side, e);
            0
        }
    }
}

/// After one side hung up, push what it left behind to the survivor.
fn flush_toward(buffer: &mut RelayBuffer, survivor: &mut dyn ProxyStream) -> usize {
    if buffer.is_empty() || !survivor.is_connected() {
        return 0;
    }
    buffer.drain_to(survivor).unwrap_or(0)
}

/// Leftover data keeps a half-dead relay alive only while the survivor
/// keeps accepting it; a pass with no progress ends the session.
fn still_draining(buffer: &RelayBuffer, survivor: &dyn ProxyStream, progressed: usize) -> bool {
    !buffer.is_empty() && survivor.is_connected() && progressed > 0
}
