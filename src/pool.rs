//! Keep-alive connection pool, keyed by `(scheme, host, port)` (spec
//! component D).
//!
//! `Pool` hands out [`Connection`]s: fresh or reused, always leased
//! exclusively to one caller. Reuse is LIFO (spec.md §9: better cache
//! locality, equally valid framing) and idle connections expire on a
//! one-shot timer scheduled through [`crate::executor`].

use crate::error::Error;
use crate::executor;
use crate::socket::{AsyncReadWrite, TcpStream};
use crate::tls::TlsConnector;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::ToSocketAddrs;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme_is_https: bool,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.scheme_is_https { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Tunables, defaulting exactly to spec.md §4.D's numbers.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub recv_bufsize: usize,
    pub keep_alive_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub body_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            recv_bufsize: 16384,
            keep_alive_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            body_timeout: Duration::from_secs(10),
        }
    }
}

struct IdleConn {
    id: u64,
    stream: Box<dyn AsyncReadWrite + Send>,
    idled_at: Instant,
}

struct PoolState {
    idle: HashMap<PoolKey, VecDeque<IdleConn>>,
    closed: bool,
}

/// A leased connection. Exclusively owned by its caller until [`Pool::release`].
pub struct Connection {
    id: u64,
    key: PoolKey,
    stream: Box<dyn AsyncReadWrite + Send>,
}

impl Connection {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn stream_mut(&mut self) -> Pin<&mut (dyn AsyncReadWrite + Send)> {
        // Every concrete stream type behind this box (`TcpStream`,
        // `TlsStream<TcpStream>`) is `Unpin`; the trait object itself just
        // isn't known to be at the type level.
        unsafe { Pin::new_unchecked(self.stream.as_mut()) }
    }
}

/// The keep-alive pool. Cloning shares the same underlying state — callers
/// hold a `Pool` the way they'd hold an `Arc`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<PoolState>>,
    config: PoolConfig,
    next_id: Arc<AtomicU64>,
    tls: TlsConnector,
}

impl Pool {
    pub fn new(config: PoolConfig, tls: TlsConnector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolState {
                idle: HashMap::new(),
                closed: false,
            })),
            config,
            next_id: Arc::new(AtomicU64::new(0)),
            tls,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns an idle connection for `key` if one exists and hasn't
    /// expired, otherwise opens a fresh one (TCP, then TLS if `key` is
    /// https). Connect failures and handshake failures both surface as
    /// [`Error::Connection`] / [`Error::Tls`] and are never placed in the
    /// pool.
    pub async fn acquire(&self, key: PoolKey) -> Result<Connection, Error> {
        {
            let mut state = self.inner.lock().unwrap();
            if state.closed {
                return Err(Error::data("pool is closed"));
            }
            if let Some(queue) = state.idle.get_mut(&key) {
                if let Some(idle) = queue.pop_back() {
                    debug!(key = %key, id = idle.id, "pool: reusing idle connection");
                    return Ok(Connection {
                        id: idle.id,
                        key,
                        stream: idle.stream,
                    });
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, id, "pool: opening fresh connection");
        let stream = self.open(&key).await?;
        Ok(Connection { id, key, stream })
    }

    async fn open(&self, key: &PoolKey) -> Result<Box<dyn AsyncReadWrite + Send>, Error> {
        let addr = resolve(&key.host, key.port)?;
        let tcp = match crate::timeout::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(inner) => inner?,
            Err(timeout_err) => return Err(timeout_err),
        };

        if key.scheme_is_https {
            let tls_stream = self.tls.connect(tcp, &key.host)?;
            Ok(Box::new(tls_stream))
        } else {
            Ok(Box::new(tcp))
        }
    }

    /// Returns a connection to the pool. If `reusable` is false, or
    /// `keep_alive_timeout` is zero, the connection is simply dropped
    /// (closing its socket). Otherwise it's parked as Idle and an
    /// idle-expiry sweep is scheduled.
    pub fn release(&self, conn: Connection, reusable: bool) {
        let Connection { id, key, stream } = conn;

        if !reusable || self.config.keep_alive_timeout.is_zero() {
            debug!(key = %key, id, reusable, "pool: discarding connection");
            return;
        }

        let mut state = self.inner.lock().unwrap();
        if state.closed {
            debug!(key = %key, id, "pool: pool closed, discarding connection");
            return;
        }
        state
            .idle
            .entry(key.clone())
            .or_default()
            .push_back(IdleConn {
                id,
                stream,
                idled_at: Instant::now(),
            });
        drop(state);

        debug!(key = %key, id, "pool: parked idle connection");
        let inner = self.inner.clone();
        let timeout = self.config.keep_alive_timeout;
        let sweep_key = key;
        executor::spawn(async move {
            executor::sleep(timeout).await;
            let mut state = inner.lock().unwrap();
            if let Some(queue) = state.idle.get_mut(&sweep_key) {
                let before = queue.len();
                queue.retain(|c| c.id != id || c.idled_at.elapsed() < timeout);
                if queue.len() != before {
                    warn!(key = %sweep_key, id, "pool: evicted idle connection past keep_alive_timeout");
                }
                if queue.is_empty() {
                    state.idle.remove(&sweep_key);
                }
            }
        });
    }

    /// Marks the pool closed (rejecting further `acquire`), drops every
    /// Idle connection, and cancels their sweepers implicitly (the sweeper
    /// closure above is a no-op once the entry it looks for is gone).
    pub fn close(&self) {
        let mut state = self.inner.lock().unwrap();
        state.closed = true;
        let count: usize = state.idle.values().map(VecDeque::len).sum();
        state.idle.clear();
        warn!(count, "pool: closed, dropped idle connections");
    }
}

fn resolve(host: &str, port: u16) -> Result<std::net::SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::connection)?
        .next()
        .ok_or_else(|| Error::data(format!("no addresses for {host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_formats_scheme() {
        let key = PoolKey {
            scheme_is_https: true,
            host: "example.com".into(),
            port: 443,
        };
        assert_eq!(key.to_string(), "https://example.com:443");
    }

    #[test]
    fn default_config_matches_spec_numbers() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.recv_bufsize, 16384);
        assert_eq!(cfg.keep_alive_timeout, Duration::from_secs(15));
    }
}
