//! Error kinds surfaced to callers of [`crate::Client::request`] and of the
//! body-stream iterator. No fallible operation in this crate swallows an
//! error: everything propagates via `Result`, with the underlying cause
//! attached.

use std::io;

/// The five failure kinds the spec distinguishes. Each carries its original
/// cause so callers can inspect the OS or TLS error that produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connect failure, DNS failure, connection refused, or reset during
    /// connect/handshake setup.
    #[error("connection failed: {0}")]
    Connection(#[source] io::Error),

    /// TLS handshake failure (certificate, protocol, or unexpected bytes).
    #[error("tls handshake failed: {0}")]
    Tls(#[source] rustls_error::RustlsError),

    /// Protocol violation, unexpected EOF, or a timed-out read/write that
    /// isn't attributed to the scoped timeout primitive itself.
    #[error("protocol error: {0}")]
    Data(String),

    /// The scoped timeout primitive's deadline fired before the bounded
    /// region completed.
    #[error("operation timed out")]
    Timeout,

    /// External cancellation propagated out of a bounded region.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn data(message: impl Into<String>) -> Self {
        Error::Data(message.into())
    }

    pub(crate) fn connection(err: io::Error) -> Self {
        Error::Connection(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // An io::Error reaching the top of a fallible chain without being
        // explicitly classified is always a connection-phase failure here:
        // the parser and serializer classify their own io errors as `Data`
        // (see response.rs / request.rs) before they ever reach `?`.
        Error::Connection(err)
    }
}

/// Thin wrapper so `rustls::Error` (which isn't `std::error::Error` stable
/// across all rustls versions in the same way) has a predictable `Display`
/// without forcing every caller to depend on `rustls` directly to match on
/// our error type.
pub mod rustls_error {
    use std::fmt;

    #[derive(Debug)]
    pub struct RustlsError(pub String);

    impl fmt::Display for RustlsError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for RustlsError {}

    impl From<rustls::Error> for RustlsError {
        fn from(err: rustls::Error) -> Self {
            RustlsError(err.to_string())
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
