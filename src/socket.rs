//! Non-blocking TCP socket shim (spec component A).
//!
//! `connect`, `send`, `recv`, and `shutdown` either complete synchronously
//! or suspend the calling task until the reactor observes the socket ready,
//! then retry. Partial writes are surfaced to the caller (see
//! [`AsyncWrite::write_all`]) so callers loop until the buffer is drained.

use crate::error::Error;
use crate::reactor::{self, Interest};
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

fn classify_connect_err(err: io::Error) -> Error {
    Error::connection(err)
}

/// A connected, non-blocking TCP stream registered with the current
/// runtime's reactor.
pub struct TcpStream {
    inner: StdTcpStream,
}

impl TcpStream {
    /// Resolves `addr` and connects, suspending until the connect
    /// completes or fails. DNS resolution itself is synchronous (an
    /// external collaborator per the spec's scope) and happens before any
    /// suspension point.
    pub async fn connect(addr: SocketAddr) -> Result<Self, Error> {
        ConnectFuture::new(addr).await
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn as_raw_fd_value(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Reads at most `buf.len()` bytes. Returns `Ok(0)` only at true EOF.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        std::future::poll_fn(|cx| self.poll_recv(cx, buf)).await
    }

    /// Writes as much of `buf` as the socket accepts in one non-blocking
    /// call, returning the number of bytes written (possibly a partial
    /// write — see spec.md §4.A).
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        std::future::poll_fn(|cx| self.poll_send(cx, buf)).await
    }

    pub fn shutdown(&self) -> Result<(), Error> {
        self.inner
            .shutdown(std::net::Shutdown::Both)
            .map_err(Error::connection)
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        match self.inner.read(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let _ = reactor::current().register(
                    self.inner.as_raw_fd(),
                    Interest::Readable,
                    cx.waker().clone(),
                );
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(classify_io_err(e))),
        }
    }

    fn poll_send(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
        match self.inner.write(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let _ = reactor::current().register(
                    self.inner.as_raw_fd(),
                    Interest::Writable,
                    cx.waker().clone(),
                );
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(classify_io_err(e))),
        }
    }
}

fn classify_io_err(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
            Error::connection(err)
        }
        io::ErrorKind::UnexpectedEof => Error::data("unexpected end of stream"),
        _ => Error::connection(err),
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        reactor::current().deregister(self.inner.as_raw_fd());
    }
}

struct ConnectFuture {
    addr: SocketAddr,
    inner: Option<StdTcpStream>,
}

impl ConnectFuture {
    fn new(addr: SocketAddr) -> Self {
        Self { addr, inner: None }
    }
}

impl Future for ConnectFuture {
    type Output = Result<TcpStream, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.inner.is_none() {
            let stream = match connect_nonblocking(self.addr) {
                Ok(stream) => stream,
                Err(e) => return Poll::Ready(Err(classify_connect_err(e))),
            };
            self.inner = Some(stream);
        }

        let fd = self.inner.as_ref().unwrap().as_raw_fd();
        match self.inner.as_ref().unwrap().take_error() {
            Ok(None) => {}
            Ok(Some(e)) => return Poll::Ready(Err(classify_connect_err(e))),
            Err(e) => return Poll::Ready(Err(classify_connect_err(e))),
        }

        // A non-blocking connect is writable once it completes (success or
        // failure); peer_addr() only succeeds once the handshake finished.
        match self.inner.as_ref().unwrap().peer_addr() {
            Ok(_) => {
                let stream = self.inner.take().unwrap();
                Poll::Ready(Ok(TcpStream { inner: stream }))
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                let _ = reactor::current().register(fd, Interest::Writable, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(classify_connect_err(e))),
        }
    }
}

fn connect_nonblocking(addr: SocketAddr) -> io::Result<StdTcpStream> {
    use std::os::unix::io::FromRawFd;

    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let (sockaddr, len) = sockaddr_for(addr);
    let rc = unsafe { libc::connect(fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) && err.kind() != io::ErrorKind::WouldBlock {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    Ok(unsafe { StdTcpStream::from_raw_fd(fd) })
}

fn sockaddr_for(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }
}

/// Readiness-driven read/write primitives shared by [`TcpStream`] and
/// [`crate::tls::TlsStream`], so the request serializer and response
/// parser can be generic over plaintext and TLS connections.
pub trait AsyncReadWrite: Unpin {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>>;
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>>;
}

impl AsyncReadWrite for TcpStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        self.poll_recv(cx, buf)
    }

    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
        self.poll_send(cx, buf)
    }
}

impl Unpin for TcpStream {}

/// Reads exactly one chunk (up to `buf.len()`) through an already-pinned
/// trait object, used by the request serializer and response parser, which
/// are generic over plaintext vs. TLS via [`crate::pool::Connection::stream_mut`].
pub async fn read_some<S: AsyncReadWrite + ?Sized>(mut stream: Pin<&mut S>, buf: &mut [u8]) -> Result<usize, Error> {
    std::future::poll_fn(|cx| stream.as_mut().poll_read(cx, buf)).await
}

/// Writes the entire buffer, looping over partial writes, through an
/// already-pinned trait object.
pub async fn write_all<S: AsyncReadWrite + ?Sized>(mut stream: Pin<&mut S>, mut buf: &[u8]) -> Result<(), Error> {
    while !buf.is_empty() {
        let n = std::future::poll_fn(|cx| stream.as_mut().poll_write(cx, buf)).await?;
        if n == 0 {
            return Err(Error::data("connection closed mid-write"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Lets the connection pool erase plaintext vs. TLS behind one boxed type.
/// `Box<T>` is `Unpin` regardless of `T`, so pinning the box is always
/// sound; dispatching into the trait object's own `poll_read`/`poll_write`
/// needs one `unsafe` pin-projection since `dyn AsyncReadWrite` itself isn't
/// known to be `Unpin`, even though every concrete implementor is.
impl AsyncReadWrite for Box<dyn AsyncReadWrite + Send> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        let inner: &mut (dyn AsyncReadWrite + Send) = self.as_mut().get_mut().as_mut();
        unsafe { Pin::new_unchecked(inner) }.poll_read(cx, buf)
    }

    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
        let inner: &mut (dyn AsyncReadWrite + Send) = self.as_mut().get_mut().as_mut();
        unsafe { Pin::new_unchecked(inner) }.poll_write(cx, buf)
    }
}
