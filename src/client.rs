//! Public request API (spec component G) tying the socket shim, TLS,
//! pool, serializer, and parser together.

use crate::error::Error;
use crate::pool::{Pool, PoolConfig, PoolKey};
use crate::request::{Body, HeaderList, Method};
use crate::response::{BodyStream, Status};
use crate::tls::TlsConnector;
use url::Url;

/// The entry point callers construct once and reuse across requests; it
/// owns the connection pool and the TLS connector used for `https` targets.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pool: Pool::new(config, TlsConnector::with_platform_roots()),
        }
    }

    /// Uses a caller-supplied TLS connector (custom roots, client certs,
    /// pinned verifiers) instead of the platform default.
    pub fn with_tls(config: PoolConfig, tls: TlsConnector) -> Self {
        Self {
            pool: Pool::new(config, tls),
        }
    }

    /// Issues one request and returns as soon as the status line and
    /// headers are parsed; the body is delivered lazily via the returned
    /// [`BodyStream`]. Callers must drain or explicitly discard it —
    /// dropping a partially-read body forces the connection non-reusable
    /// (spec.md §4.G).
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(String, String)],
        headers: &HeaderList,
        body: Body,
    ) -> Result<(Status, HeaderList, BodyStream), Error> {
        let parsed = Url::parse(url).map_err(|e| Error::data(format!("invalid URL: {e}")))?;
        let scheme_is_https = match parsed.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::data(format!("unsupported scheme: {other}"))),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::data("URL has no host"))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| Error::data("URL has no resolvable port"))?;

        let key = PoolKey {
            scheme_is_https,
            host,
            port,
        };

        let config = *self.pool.config();
        let target = crate::request::compose_target(parsed.path(), params);

        let mut conn = crate::timeout::timeout(config.connect_timeout, self.pool.acquire(key))
            .await
            .map_err(|e| classify_scope_timeout(e, "connect"))??;

        if let Err(e) = crate::request::write_request(&mut conn, method, &target, headers, body, config.request_timeout).await {
            self.pool.release(conn, false);
            return Err(e);
        }

        crate::response::read_response(
            self.pool.clone(),
            conn,
            config.recv_bufsize,
            config.request_timeout,
            config.body_timeout,
        )
        .await
    }

    /// Convenience adapter: runs `request` and concatenates the entire body
    /// into one buffer before returning.
    pub async fn buffered(
        &self,
        method: Method,
        url: &str,
        params: &[(String, String)],
        headers: &HeaderList,
        body: Body,
    ) -> Result<(Status, HeaderList, Vec<u8>), Error> {
        let (status, headers, mut stream) = self.request(method, url, params, headers, body).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok((status, headers, buf))
    }

    /// Convenience adapter: wraps a single in-memory buffer as a one-shot
    /// request body.
    pub fn streamed(bytes: impl Into<Vec<u8>>) -> Body {
        Body::buffered(bytes)
    }

    /// Closes the pool: rejects further `acquire`, drops all Idle
    /// connections. In-flight leased connections finish under their
    /// holders' control.
    pub fn close(&self) {
        self.pool.close();
    }
}

fn classify_scope_timeout(err: Error, phase: &str) -> Error {
    match err {
        Error::Timeout => Error::data(format!("{phase} timed out")),
        other => other,
    }
}
