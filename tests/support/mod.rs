//! Loopback test-server helpers shared by the integration tests. A real
//! TCP server on a background thread is closer to how this client will
//! actually misbehave (partial writes, stalls, connection reuse) than any
//! in-process mock could be.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Installs a `tracing` subscriber once per process so `pool.rs`'s
/// `debug!`/`warn!` call sites show up under `RUST_LOG=httpflow=debug
/// cargo test -- --nocapture`. Safe to call from every test; later calls
/// are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Reads bytes off `stream` until the blank line terminating a request's
/// headers. Any body bytes are left unread, which is fine since every test
/// server here only exercises GET requests with empty bodies.
pub fn read_request_head(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("read request byte");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return;
        }
    }
}

pub fn write_all(stream: &mut impl Write, bytes: &[u8]) {
    stream.write_all(bytes).expect("write to test client");
}

/// Reads exactly `len` bytes of request body off `stream`, for servers that
/// need to verify a streamed request payload rather than ignore it.
pub fn read_exact_body(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read request body");
    buf
}

/// Runs `handler` once per accepted connection on a background thread,
/// returning a shared counter of how many connections were accepted.
pub fn serve<F>(listener: TcpListener, handler: F) -> Arc<AtomicUsize>
where
    F: Fn(TcpStream, usize) + Send + 'static,
{
    let accepts = Arc::new(AtomicUsize::new(0));
    let counted = accepts.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let idx = counted.fetch_add(1, Ordering::SeqCst);
            handler(stream, idx);
        }
    });
    accepts
}
