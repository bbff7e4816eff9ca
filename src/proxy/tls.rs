//! TLS for the outbound leg.
//!
//! Targets on well-known TLS ports are reached through a rustls client with
//! certificate verification switched off. After the handshake the connection
//! is split back into socket and rustls state so the session can drive it
//! with the same non-blocking calls it uses for plain TCP.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::stream::ProxyStream;
use crate::error::{Error, Result};

/// Build a client config that accepts any server certificate.
pub fn insecure_client_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(NoVerifier::new(&provider));

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Run the TLS handshake over an already connected socket.
///
/// The target is addressed by IP, so no SNI is sent.
pub async fn handshake(
    config: Arc<ClientConfig>,
    target: SocketAddrV4,
    tcp: TcpStream,
) -> Result<TlsProxyStream> {
    let server_name = ServerName::from(IpAddr::V4(*target.ip()));
    let tls = TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::tls(format!("handshake with {}: {}", target, e)))?;

    let (tcp, conn) = tls.into_inner();
    Ok(TlsProxyStream::new(tcp, conn))
}

/// Accepts every certificate; signatures are still checked against the
/// provider's algorithms so the handshake itself stays well-formed.
#[derive(Debug)]
pub struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Adapts a tokio socket to `Read`/`Write` using its non-blocking calls.
struct NonBlocking<'a>(&'a TcpStream);

impl Read for NonBlocking<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for NonBlocking<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Established TLS client connection driven without waiting.
pub struct TlsProxyStream {
    tcp: Option<TcpStream>,
    conn: ClientConnection,
    peer: Option<SocketAddr>,
    eof: bool,
}

impl TlsProxyStream {
    fn new(tcp: TcpStream, conn: ClientConnection) -> Self {
        let peer = tcp.peer_addr().ok();
        Self {
            tcp: Some(tcp),
            conn,
            peer,
            eof: false,
        }
    }

    /// Push pending records to the socket until it stops accepting them.
    fn flush_tls(&mut self) -> io::Result<()> {
        let Some(tcp) = &self.tcp else {
            return Ok(());
        };

        while self.conn.wants_write() {
            match self.conn.write_tls(&mut NonBlocking(tcp)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.eof = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Pull ciphertext off the socket and decrypt it.
    fn fill_plaintext(&mut self) -> io::Result<()> {
        let Some(tcp) = &self.tcp else {
            return Ok(());
        };

        let mut failure = None;
        while self.conn.wants_read() {
            match self.conn.read_tls(&mut NonBlocking(tcp)) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(_) => {
                    if let Err(e) = self.conn.process_new_packets() {
                        failure = Some(e);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.eof = true;
                    return Err(e);
                }
            }
        }

        if let Some(e) = failure {
            self.eof = true;
            // Let the alert out before giving up
            let _ = self.flush_tls();
            return Err(io::Error::new(io::ErrorKind::InvalidData, e));
        }
        Ok(())
    }
}

impl ProxyStream for TlsProxyStream {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.tcp.is_none() || buf.is_empty() {
            return Ok(0);
        }

        self.fill_plaintext()?;
        self.flush_tls()?;

        match self.conn.reader().read(buf) {
            // close_notify received and nothing left
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.eof = true;
                Ok(0)
            }
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tcp.is_none() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        self.flush_tls()?;
        if self.conn.wants_write() {
            // Socket still full of earlier records
            return Ok(0);
        }

        let n = self.conn.writer().write(buf)?;
        self.flush_tls()?;
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.tcp.is_some() && !self.eof
    }

    fn close(&mut self) {
        if self.tcp.is_some() {
            self.conn.send_close_notify();
            let _ = self.flush_tls();
        }
        self.tcp = None;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
