//! Client-side TLS handshake and unwrap (spec component B), layered over
//! any [`AsyncReadWrite`] transport — in practice always [`crate::socket::TcpStream`].
//!
//! No server-side config, no ALPN/h2 negotiation: those belong to the
//! HTTP/2 and TLS-server non-goals this crate doesn't implement. The
//! connector takes a caller-supplied [`rustls::ClientConfig`] so callers
//! control cipher suites, client auth, and root trust; [`with_platform_roots`]
//! is a convenience for the common case of trusting the public web PKI.

use crate::error::Error;
use crate::socket::AsyncReadWrite;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{self, Cursor, Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

const TLS_RECORD_BUF: usize = 16 * 1024;

/// Wraps a connector config so callers don't have to depend on `rustls`
/// directly for the common case.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Uses a caller-provided config (custom roots, client certs, pinned
    /// verifiers, and so on).
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Trusts the Mozilla root program shipped by `webpki-roots`, with no
    /// client certificate. The common case for talking to public servers.
    pub fn with_platform_roots() -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }

    /// Trusts only the CA certificates in a PEM-encoded bundle, ignoring
    /// the platform trust store. Intended for talking to test fixtures
    /// (self-signed loopback servers) and private CAs, not general use.
    pub fn with_ca_pem(pem: &[u8]) -> Result<Self, Error> {
        let mut reader = std::io::BufReader::new(pem);
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| Error::data(format!("invalid CA certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::data(format!("untrusted CA certificate: {e}")))?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Begins a handshake over `transport` for `server_name`. The returned
    /// stream drives the handshake lazily on first read/write; callers that
    /// want the handshake to run eagerly should issue an empty `write_all`
    /// first (`client.rs` does this before sending the request line).
    pub fn connect<T: AsyncReadWrite + 'static>(
        &self,
        transport: T,
        server_name: &str,
    ) -> Result<TlsStream<T>, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::data(format!("invalid TLS server name: {server_name}")))?;
        let conn = ClientConnection::new(self.config.clone(), name)?;
        Ok(TlsStream {
            transport,
            conn,
            eof: false,
        })
    }
}

/// A TLS-wrapped transport that drives `rustls`'s want-read/want-write loop
/// inside `poll_read`/`poll_write`, per spec.md §4.B.
pub struct TlsStream<T> {
    transport: T,
    conn: ClientConnection,
    eof: bool,
}

impl<T: AsyncReadWrite> TlsStream<T> {
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Drains `rustls`'s outgoing TLS record buffer to the transport,
    /// looping until there's nothing left to write or the transport would
    /// block.
    fn drain_outgoing(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        while self.conn.wants_write() {
            let mut buf = [0u8; TLS_RECORD_BUF];
            let mut cursor = Cursor::new(&mut buf[..]);
            let n = match self.conn.write_tls(&mut cursor) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Poll::Ready(Err(Error::data(e.to_string()))),
            };
            let mut offset = 0;
            while offset < n {
                match Pin::new(&mut self.transport).poll_write(cx, &buf[offset..n]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(Error::data("connection closed mid-handshake")))
                    }
                    Poll::Ready(Ok(written)) => offset += written,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Feeds one readiness-driven chunk of ciphertext from the transport
    /// into `rustls`'s incoming buffer and processes any newly complete
    /// records. Non-blocking: returns `Ready(Ok(false))` if the transport
    /// had nothing to offer without suspending.
    fn fill_incoming(&mut self, cx: &mut Context<'_>) -> Poll<Result<bool, Error>> {
        let mut buf = [0u8; TLS_RECORD_BUF];
        match Pin::new(&mut self.transport).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(0)) => {
                self.eof = true;
                Poll::Ready(Ok(false))
            }
            Poll::Ready(Ok(n)) => {
                let mut cursor = Cursor::new(&buf[..n]);
                if let Err(e) = self.conn.read_tls(&mut cursor) {
                    return Poll::Ready(Err(Error::data(e.to_string())));
                }
                if let Err(e) = self.conn.process_new_packets() {
                    return Poll::Ready(Err(e.into()));
                }
                Poll::Ready(Ok(true))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_read_impl(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        loop {
            if let Poll::Pending = self.drain_outgoing(cx) {
                return Poll::Pending;
            }

            match self.conn.reader().read(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.eof {
                        return Poll::Ready(Ok(0));
                    }
                    match self.fill_incoming(cx) {
                        Poll::Ready(Ok(true)) => continue,
                        Poll::Ready(Ok(false)) => return Poll::Ready(Ok(0)),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Err(e) => return Poll::Ready(Err(Error::data(e.to_string()))),
            }
        }
    }

    fn poll_write_impl(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
        while self.conn.is_handshaking() {
            match self.drain_outgoing(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
            if !self.conn.is_handshaking() {
                break;
            }
            match self.fill_incoming(cx) {
                Poll::Ready(Ok(_)) => continue,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return Poll::Ready(Err(Error::data(e.to_string()))),
        };

        if let Poll::Pending = self.drain_outgoing(cx) {
            return Poll::Pending;
        }

        Poll::Ready(Ok(n))
    }
}

impl<T: AsyncReadWrite> AsyncReadWrite for TlsStream<T> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        self.poll_read_impl(cx, buf)
    }

    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
        self.poll_write_impl(cx, buf)
    }
}

impl<T> Unpin for TlsStream<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_roots_connector_builds() {
        let _connector = TlsConnector::with_platform_roots();
    }
}
