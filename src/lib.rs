//! A minimal, streaming HTTP/1.1 client over non-blocking TCP sockets,
//! with optional TLS, a keep-alive connection pool, and a scoped timeout
//! primitive. No HTTP/2, no pipelining, no retries/redirects/cookies, no
//! automatic header injection, no persistent on-disk cache — callers
//! control framing headers and connection lifetime explicitly.
//!
//! The crate carries its own single-threaded cooperative executor and
//! epoll/kqueue reactor rather than depending on an existing async
//! runtime, so [`Client::request`] must run inside [`executor::Runtime::block_on`].

pub mod client;
pub mod error;
pub mod executor;
pub mod pool;
pub mod reactor;
pub mod request;
pub mod response;
pub mod socket;
pub mod timeout;
pub mod tls;

pub use client::Client;
pub use error::{Error, Result};
pub use executor::Runtime;
pub use pool::{PoolConfig, PoolKey};
pub use request::{Body, ChunkSource, HeaderList, Method};
pub use response::{BodyStream, Status};
pub use timeout::{timeout, with_cancellation, CancellationToken};
pub use tls::TlsConnector;
