//! Per-connection SOCKS5 state machine.
//!
//! A [`Session`] is advanced by [`Session::process`], once per scheduler
//! pass. Each pass reads whatever the client has sent, then runs state
//! handlers until one of them needs more input. The state enum carries only
//! what is valid in that state: the target and its in-flight dial exist from
//! `Connecting` on, the remote stream and relay buffers only while
//! `Relaying`.
//!
//! Only hostname resolution is awaited inside a pass. The dial runs on its
//! own task and is checked once per pass, so a slow target holds up nothing
//! but its own slot.
//!
//! ```text
//!   Init ─▶ MethodNegotiation ─▶ RequestParsing ─▶ Connecting ─▶ Relaying
//!     └──────────────┴──────────────────┴──────────────┴────────────┴─▶ Closed
//! ```

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::proxy::connector::{Connector, DialPolicy, Dialer, PendingDial, Resolver};
use crate::proxy::relay::{Relay, RelayBuffer, RelayStatus};
use crate::proxy::socks5::{self, Parsed, Reply, TargetAddr};
use crate::proxy::stream::{ProxyStream, RemoteStream};
use crate::server::config::ServerConfig;
use crate::server::metrics::ServerMetrics;

/// Collaborators and tunables shared by every session of a pool.
pub struct SessionContext {
    pub connector: Connector,
    pub resolver: Arc<dyn Resolver>,
    pub inbound_buffer_size: usize,
    pub outbound_buffer_size: usize,
    pub metrics: Arc<ServerMetrics>,
}

impl SessionContext {
    /// Build a context from configuration and the dial/resolve seams.
    pub fn new(
        config: &ServerConfig,
        dialer: Arc<dyn Dialer>,
        resolver: Arc<dyn Resolver>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            connector: Connector::new(
                dialer,
                DialPolicy::new(config.encrypted_ports.clone()),
                config.dial_timeout,
            ),
            resolver,
            inbound_buffer_size: config.inbound_buffer_size,
            outbound_buffer_size: config.outbound_buffer_size,
            metrics,
        }
    }
}

/// Session lifecycle state.
pub enum SessionState {
    /// Waiting for the first greeting bytes
    Init,
    /// Greeting buffered, choosing an auth method
    MethodNegotiation,
    /// Waiting for a complete CONNECT request
    RequestParsing,
    /// Target known, dial running in the background
    Connecting {
        target: SocketAddrV4,
        dial: PendingDial,
    },
    /// Pumping bytes between client and target
    Relaying { remote: RemoteStream, relay: Relay },
    /// Finished; the slot may be reused
    Closed,
}

/// Discriminant of [`SessionState`], for logging and checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Init,
    MethodNegotiation,
    RequestParsing,
    Connecting,
    Relaying,
    Closed,
}

impl StateKind {
    pub fn name(self) -> &'static str {
        match self {
            StateKind::Init => "Init",
            StateKind::MethodNegotiation => "MethodNegotiation",
            StateKind::RequestParsing => "RequestParsing",
            StateKind::Connecting => "Connecting",
            StateKind::Relaying => "Relaying",
            StateKind::Closed => "Closed",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SessionState {
    pub fn kind(&self) -> StateKind {
        match self {
            SessionState::Init => StateKind::Init,
            SessionState::MethodNegotiation => StateKind::MethodNegotiation,
            SessionState::RequestParsing => StateKind::RequestParsing,
            SessionState::Connecting { .. } => StateKind::Connecting,
            SessionState::Relaying { .. } => StateKind::Relaying,
            SessionState::Closed => StateKind::Closed,
        }
    }
}

/// What the pass loop does after a handler returns.
enum Step {
    /// State changed; run the next handler now
    Continue,
    /// Nothing more to do until the next pass
    Wait,
}

/// One proxied client connection.
pub struct Session {
    slot: usize,
    peer: Option<SocketAddr>,
    local: Box<dyn ProxyStream>,
    state: SessionState,
    /// Raw handshake bytes; sized for the largest request
    handshake: RelayBuffer,
    ctx: Arc<SessionContext>,
}

impl Session {
    /// Create a session in `Init` for an accepted client.
    pub fn new(slot: usize, local: Box<dyn ProxyStream>, ctx: Arc<SessionContext>) -> Self {
        let peer = local.peer_addr();
        match peer {
            Some(peer) => tracing::debug!(slot, "session init with client {}", peer),
            None => tracing::debug!(slot, "session init"),
        }

        Self {
            slot,
            peer,
            local,
            state: SessionState::Init,
            handshake: RelayBuffer::new(socks5::MAX_REQUEST_LEN),
            ctx,
        }
    }

    /// Slot index this session occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Client address, when the transport reports one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    fn in_handshake(&self) -> bool {
        matches!(
            self.state,
            SessionState::Init | SessionState::MethodNegotiation | SessionState::RequestParsing
        )
    }

    /// Advance the session by one scheduler pass.
    pub async fn process(&mut self) {
        if self.is_closed() {
            return;
        }

        if self.in_handshake() {
            self.read_handshake();
        }

        loop {
            let step = match self.state.kind() {
                StateKind::Init => Ok(self.await_greeting()),
                StateKind::MethodNegotiation => self.negotiate_method(),
                StateKind::RequestParsing => self.handle_request().await,
                StateKind::Connecting => self.connect().await,
                StateKind::Relaying => self.relay(),
                StateKind::Closed => Ok(Step::Wait),
            };

            match step {
                Ok(Step::Continue) => continue,
                Ok(Step::Wait) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }

        if self.in_handshake() && !self.local.is_connected() {
            tracing::debug!(slot = self.slot, "client went away during handshake");
            self.close();
        }
    }

    fn read_handshake(&mut self) {
        if let Err(e) = self.handshake.fill_from(self.local.as_mut()) {
            tracing::debug!(slot = self.slot, "read from client failed: {}", e);
        }
    }

    fn await_greeting(&mut self) -> Step {
        if self.handshake.len() >= socks5::GREETING_MIN_LEN {
            self.state = SessionState::MethodNegotiation;
            Step::Continue
        } else {
            Step::Wait
        }
    }

    fn negotiate_method(&mut self) -> Result<Step> {
        self.expect(StateKind::MethodNegotiation)?;

        match socks5::parse_greeting(self.handshake.as_slice())? {
            Parsed::Incomplete => Ok(Step::Wait),
            Parsed::Complete { consumed, .. } => {
                self.send(&socks5::method_reply(socks5::METHOD_NO_AUTH));
                self.handshake.consume(consumed);
                tracing::debug!(slot = self.slot, "no-auth method selected");
                self.state = SessionState::RequestParsing;
                Ok(Step::Continue)
            }
        }
    }

    async fn handle_request(&mut self) -> Result<Step> {
        self.expect(StateKind::RequestParsing)?;

        let (request, consumed) = match socks5::parse_request(self.handshake.as_slice())? {
            Parsed::Incomplete => return Ok(Step::Wait),
            Parsed::Complete { value, consumed } => (value, consumed),
        };

        let ip = match &request.addr {
            TargetAddr::Ipv4(ip) => {
                tracing::debug!(
                    slot = self.slot,
                    "CONNECT request to IP {}:{}",
                    ip,
                    request.port
                );
                *ip
            }
            TargetAddr::Domain(hostname) => {
                // Stalls the whole pass until the resolver answers
                let ip = self
                    .ctx
                    .resolver
                    .resolve(hostname)
                    .await
                    .ok_or_else(|| Error::Resolve(hostname.clone()))?;
                tracing::debug!(
                    slot = self.slot,
                    "CONNECT request to hostname {}:{}, resolved to IP {}",
                    hostname,
                    request.port,
                    ip
                );
                ip
            }
        };

        let target = SocketAddrV4::new(ip, request.port);
        if ip.is_unspecified() || request.port == 0 {
            return Err(Error::BadAddress(target));
        }

        self.handshake.consume(consumed);
        tracing::debug!(slot = self.slot, "dialing {}", target);
        let dial = self.ctx.connector.start(target);
        self.state = SessionState::Connecting { target, dial };
        Ok(Step::Continue)
    }

    async fn connect(&mut self) -> Result<Step> {
        let (target, dial) = match &mut self.state {
            SessionState::Connecting { target, dial } => (*target, dial),
            other => return Err(invariant(StateKind::Connecting, other)),
        };

        if !dial.is_finished() {
            if !self.local.is_connected() {
                tracing::debug!(slot = self.slot, "client went away while dialing");
                self.close();
            }
            return Ok(Step::Wait);
        }

        let remote = dial.outcome().await?;
        let encrypted = remote.is_encrypted();
        self.ctx.metrics.record_dial(encrypted);
        tracing::debug!(slot = self.slot, encrypted, "connected to {}", target);

        self.send(&socks5::encode_reply(Reply::Success, target));

        let mut relay = Relay::new(self.ctx.inbound_buffer_size, self.ctx.outbound_buffer_size);
        // Bytes the client sent right behind its request
        let pipelined = self.handshake.len();
        if relay.inbound_mut().extend_from_slice(self.handshake.as_slice()) < pipelined {
            tracing::warn!(
                slot = self.slot,
                "dropped pipelined bytes beyond the inbound buffer"
            );
        }
        self.handshake.clear();

        self.state = SessionState::Relaying { remote, relay };
        Ok(Step::Continue)
    }

    fn relay(&mut self) -> Result<Step> {
        let report = match &mut self.state {
            SessionState::Relaying { remote, relay } => relay.pump(self.local.as_mut(), remote),
            other => return Err(invariant(StateKind::Relaying, other)),
        };

        self.ctx
            .metrics
            .add_relayed(report.to_remote, report.to_local);

        if report.status == RelayStatus::Closed {
            tracing::debug!(slot = self.slot, "relay finished");
            self.state = SessionState::Closed;
        }
        Ok(Step::Wait)
    }

    fn expect(&self, expected: StateKind) -> Result<()> {
        let actual = self.state.kind();
        if actual != expected {
            return Err(invariant(expected, &self.state));
        }
        Ok(())
    }

    /// Report `err` to the client when it has a reply, then close.
    fn fail(&mut self, err: Error) {
        let slot = self.slot;

        match &err {
            Error::Invariant { .. } => tracing::error!(slot, "{}", err),
            Error::NoAcceptableMethod => {
                tracing::error!(slot, "no supported auth methods");
                self.send(&socks5::method_reply(socks5::METHOD_NO_ACCEPTABLE));
            }
            _ => {
                if err.is_dial_failure() {
                    tracing::warn!(slot, "{}", err);
                } else {
                    tracing::error!(slot, "{}", err);
                }
                if let Some(code) = err.reply_code() {
                    self.send(&socks5::failure_reply(code));
                }
            }
        }

        if err.is_protocol_violation() {
            tracing::debug!(
                slot,
                "rejected handshake bytes: {}",
                hex::encode(self.handshake.as_slice())
            );
            self.ctx.metrics.increment_protocol_errors();
        } else if err.is_dial_failure() {
            self.ctx.metrics.increment_dial_failures();
        }

        self.close();
    }

    fn send(&mut self, msg: &[u8]) {
        match self.local.write_some(msg) {
            Ok(n) if n == msg.len() => {}
            Ok(n) => tracing::warn!(
                slot = self.slot,
                "short reply write ({} of {} bytes)",
                n,
                msg.len()
            ),
            Err(e) => tracing::debug!(slot = self.slot, "reply not delivered: {}", e),
        }
    }

    /// Close both streams and enter `Closed`.
    pub fn close(&mut self) {
        if let SessionState::Relaying { remote, .. } = &mut self.state {
            remote.close();
        }
        self.local.close();
        self.handshake.clear();
        self.state = SessionState::Closed;
    }
}

fn invariant(expected: StateKind, actual: &SessionState) -> Error {
    Error::Invariant {
        expected: expected.name(),
        actual: actual.kind().name(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::proxy::connector::testing::{RecordingDialer, StaticResolver};
    use crate::proxy::memory::{MemoryPeer, MemoryStream};

    const GREETING: [u8; 3] = [0x05, 0x01, 0x00];
    const CONNECT_V4: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];
    const SUCCESS_V4: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];

    struct Fixture {
        session: Session,
        client: MemoryPeer,
        dialer: Arc<RecordingDialer>,
        metrics: Arc<ServerMetrics>,
    }

    fn fixture_with(dialer: RecordingDialer) -> Fixture {
        let dialer = Arc::new(dialer);
        let metrics = Arc::new(ServerMetrics::new());
        let resolver = StaticResolver::default()
            .with("example.com", Ipv4Addr::new(93, 184, 216, 34))
            .with("zero.test", Ipv4Addr::UNSPECIFIED);
        let ctx = Arc::new(SessionContext::new(
            &ServerConfig::default(),
            dialer.clone(),
            Arc::new(resolver),
            Arc::clone(&metrics),
        ));

        let (local, client) = MemoryStream::pair();
        Fixture {
            session: Session::new(0, Box::new(local), ctx),
            client,
            dialer,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingDialer::default())
    }

    /// One pass, then as many more as a dial started in it takes to land.
    async fn pass(session: &mut Session) {
        session.process().await;
        for _ in 0..100 {
            if session.state().kind() != StateKind::Connecting {
                return;
            }
            tokio::task::yield_now().await;
            session.process().await;
        }
    }

    fn domain_request(name: &str, port: u16) -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
        req.extend_from_slice(name.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    #[tokio::test]
    async fn test_bad_version_closes_in_one_pass() {
        let mut f = fixture();
        f.client.send(&[0x04, 0x01, 0x00]);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert_eq!(
            f.client.take_received(),
            [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        assert!(f.client.is_closed_by_stream());
        assert!(f.dialer.dials.lock().is_empty());
        assert_eq!(f.metrics.snapshot().protocol_errors, 1);
    }

    #[tokio::test]
    async fn test_zero_methods_rejected() {
        let mut f = fixture();
        f.client.send(&[0x05, 0x00, 0x00]);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert_eq!(f.client.take_received(), [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_no_auth_selected_among_methods() {
        let mut f = fixture();
        f.client.send(&[0x05, 0x02, 0x02, 0x00]);

        pass(&mut f.session).await;

        assert_eq!(f.client.take_received(), [0x05, 0x00]);
        assert_eq!(f.session.state().kind(), StateKind::RequestParsing);
    }

    #[tokio::test]
    async fn test_auth_only_rejected() {
        let mut f = fixture();
        f.client.send(&[0x05, 0x01, 0x02]);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert_eq!(f.client.take_received(), [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_short_greeting_waits() {
        let mut f = fixture();
        f.client.send(&[0x05, 0x01]);

        pass(&mut f.session).await;
        assert_eq!(f.session.state().kind(), StateKind::Init);
        assert!(f.client.take_received().is_empty());

        f.client.send(&[0x00]);
        pass(&mut f.session).await;
        assert_eq!(f.session.state().kind(), StateKind::RequestParsing);
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let mut f = fixture();
        f.client.send(&GREETING);
        pass(&mut f.session).await;
        assert_eq!(f.client.take_received(), [0x05, 0x00]);

        f.client.send(&CONNECT_V4);
        pass(&mut f.session).await;

        assert_eq!(f.client.take_received(), SUCCESS_V4);
        assert_eq!(f.session.state().kind(), StateKind::Relaying);
        assert_eq!(
            f.dialer.dials.lock().clone(),
            vec![(SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80), false)]
        );
        assert_eq!(f.metrics.snapshot().plain_dials, 1);
    }

    #[tokio::test]
    async fn test_request_delivered_byte_by_byte() {
        let mut f = fixture();
        for byte in GREETING.iter().chain(CONNECT_V4.iter()) {
            f.client.send(&[*byte]);
            pass(&mut f.session).await;
            assert!(!f.session.is_closed());
        }

        assert_eq!(f.session.state().kind(), StateKind::Relaying);
        let mut expected = vec![0x05, 0x00];
        expected.extend_from_slice(&SUCCESS_V4);
        assert_eq!(f.client.take_received(), expected);
    }

    #[tokio::test]
    async fn test_ipv6_rejected() {
        let mut f = fixture();
        f.client.send(&GREETING);
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0xfe; 18]);
        f.client.send(&req);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        let received = f.client.take_received();
        assert_eq!(&received[..2], [0x05, 0x00]);
        assert_eq!(&received[2..4], [0x05, 0x08]);
        assert!(f.dialer.dials.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let mut f = fixture();
        f.client.send(&GREETING);
        f.client.send(&[0x05, 0x03, 0x00, 0x01, 1, 2, 3, 4, 0, 53]);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        let received = f.client.take_received();
        assert_eq!(&received[2..], [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_domain_port_selects_encryption() {
        for (port, encrypted) in [(443u16, true), (80, false)] {
            let mut f = fixture();
            f.client.send(&GREETING);
            f.client.send(&domain_request("example.com", port));

            pass(&mut f.session).await;

            assert_eq!(f.session.state().kind(), StateKind::Relaying);
            let dials = f.dialer.dials.lock().clone();
            assert_eq!(
                dials,
                vec![(
                    SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), port),
                    encrypted
                )]
            );
            match f.session.state() {
                SessionState::Relaying { remote, .. } => {
                    assert_eq!(remote.is_encrypted(), encrypted)
                }
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn test_unresolvable_domain() {
        let mut f = fixture();
        f.client.send(&GREETING);
        f.client.send(&domain_request("nowhere.invalid", 80));

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert_eq!(&f.client.take_received()[2..4], [0x05, 0x08]);
        assert_eq!(f.metrics.snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn test_zero_target_rejected() {
        let mut f = fixture();
        f.client.send(&GREETING);
        f.client.send(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 0]);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert_eq!(&f.client.take_received()[2..4], [0x05, 0x08]);
        assert!(f.dialer.dials.lock().is_empty());

        let mut f = fixture();
        f.client.send(&GREETING);
        f.client.send(&domain_request("zero.test", 80));
        pass(&mut f.session).await;
        assert!(f.session.is_closed());
        assert!(f.dialer.dials.lock().is_empty());
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let mut f = fixture_with(RecordingDialer::refusing());
        f.client.send(&GREETING);
        f.client.send(&CONNECT_V4);

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert_eq!(
            &f.client.take_received()[2..],
            [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(f.metrics.snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn test_pipelined_payload_reaches_target() {
        let mut f = fixture();
        let mut burst = GREETING.to_vec();
        burst.extend_from_slice(&CONNECT_V4);
        burst.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
        f.client.send(&burst);

        pass(&mut f.session).await;

        let target = f.dialer.last_peer().unwrap();
        assert_eq!(target.take_received(), b"GET / HTTP/1.0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_relay_and_hangup() {
        let mut f = fixture();
        f.client.send(&GREETING);
        f.client.send(&CONNECT_V4);
        pass(&mut f.session).await;
        f.client.take_received();
        let target = f.dialer.last_peer().unwrap();

        f.client.send(b"ping");
        pass(&mut f.session).await;
        pass(&mut f.session).await;
        assert_eq!(target.take_received(), b"ping");

        target.send(b"pong");
        pass(&mut f.session).await;
        pass(&mut f.session).await;
        assert_eq!(f.client.take_received(), b"pong");

        target.close();
        pass(&mut f.session).await;
        assert!(f.session.is_closed());
        assert!(f.client.is_closed_by_stream());

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.bytes_to_remote, 4);
        assert_eq!(snapshot.bytes_to_local, 4);
    }

    #[tokio::test]
    async fn test_client_leaves_during_handshake() {
        let mut f = fixture();
        f.client.send(&[0x05]);
        f.client.close();

        pass(&mut f.session).await;

        assert!(f.session.is_closed());
        assert!(f.client.take_received().is_empty());
    }

    #[tokio::test]
    async fn test_invariant_violation_closes_silently() {
        let mut f = fixture();

        let err = f.session.connect().await.err().unwrap();
        assert!(matches!(
            err,
            Error::Invariant {
                expected: "Connecting",
                actual: "Init"
            }
        ));

        f.session.fail(err);
        assert!(f.session.is_closed());
        assert!(f.client.take_received().is_empty());
        assert!(f.dialer.dials.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pending_dial_waits_without_reply() {
        let mut f = fixture_with(RecordingDialer::stalling_port(80));
        f.client.send(&GREETING);
        f.client.send(&CONNECT_V4);

        for _ in 0..5 {
            f.session.process().await;
            tokio::task::yield_now().await;
        }

        assert_eq!(f.session.state().kind(), StateKind::Connecting);
        assert_eq!(f.client.take_received(), [0x05, 0x00]);
        assert_eq!(f.dialer.dials.lock().len(), 1);

        f.client.close();
        f.session.process().await;
        assert!(f.session.is_closed());
        assert!(f.client.take_received().is_empty());
    }

    #[tokio::test]
    async fn test_peer_addr_kept() {
        let peer: SocketAddr = "192.168.4.2:50123".parse().unwrap();
        let ctx = fixture().session.ctx;
        let (local, _client) = MemoryStream::pair();

        let session = Session::new(3, Box::new(local.with_peer_addr(peer)), ctx);
        assert_eq!(session.slot(), 3);
        assert_eq!(session.peer_addr(), Some(peer));
    }
}
