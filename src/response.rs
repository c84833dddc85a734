//! Incremental HTTP/1.1 response parser (spec component F).
//!
//! `httparse` parses the status line and header block — it natively
//! reports `Status::Partial` when more bytes are needed, which is exactly
//! the suspension point the spec describes. Body framing (`Identity` and
//! `Chunked`) is hand-rolled, since `httparse` only understands request/
//! response framing metadata, never bodies.

use crate::error::Error;
use crate::pool::{Connection, Pool};
use crate::request::HeaderList;
use crate::socket;
use std::time::Duration;

const MAX_HEADERS: usize = 64;
const MAX_CHUNK_SIZE_LINE: usize = 8 * 1024;

/// A three-digit status code and reason phrase, kept as the raw bytes the
/// spec's data model describes rather than parsed into a richer enum.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: [u8; 3],
    pub reason: String,
}

impl Status {
    pub fn code_u16(&self) -> u16 {
        let s = std::str::from_utf8(&self.code).unwrap_or("000");
        s.parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    AwaitSize,
    InChunk(u64),
    AwaitTrailerCrlf,
    Done,
}

#[derive(Debug)]
enum Mode {
    Identity(u64),
    Chunked(ChunkState),
}

/// Reads the status line and headers off `conn`, then returns a
/// [`BodyStream`] the caller drains for the body. `headers_timeout` bounds
/// the whole status+header read.
pub async fn read_response(
    pool: Pool,
    mut conn: Connection,
    recv_bufsize: usize,
    headers_timeout: Duration,
    body_timeout: Duration,
) -> Result<(Status, HeaderList, BodyStream), Error> {
    let result = crate::timeout::timeout(headers_timeout, read_head(&mut conn, recv_bufsize)).await;
    let (status, headers, carry_over) = match result {
        Ok(inner) => match inner {
            Ok(parts) => parts,
            Err(e) => {
                pool.release(conn, false);
                return Err(e);
            }
        },
        Err(Error::Timeout) => {
            pool.release(conn, false);
            return Err(Error::data("response headers timed out"));
        }
        Err(other) => {
            pool.release(conn, false);
            return Err(other);
        }
    };

    let mode = match select_mode(&headers) {
        Ok(mode) => mode,
        Err(e) => {
            pool.release(conn, false);
            return Err(e);
        }
    };
    let stream = BodyStream {
        pool,
        conn: Some(conn),
        carry_over,
        recv_bufsize,
        mode,
        body_timeout,
    };
    Ok((status, headers, stream))
}

async fn read_head(conn: &mut Connection, recv_bufsize: usize) -> Result<(Status, HeaderList, Vec<u8>), Error> {
    let mut buf = vec![0u8; recv_bufsize.max(4096)];
    let mut filled = 0usize;

    loop {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut raw_headers);
        match resp.parse(&buf[..filled]) {
            Ok(httparse::Status::Complete(header_len)) => {
                let code = resp.code.ok_or_else(|| Error::data("missing status code"))?;
                let reason = resp.reason.unwrap_or("").to_string();
                let code_bytes = format!("{code:03}").into_bytes();
                let mut code_arr = [b'0'; 3];
                code_arr.copy_from_slice(&code_bytes[..3]);

                let mut headers = HeaderList::new();
                for h in resp.headers.iter() {
                    let value = std::str::from_utf8(h.value)
                        .map_err(|_| Error::data("non-UTF-8 header value"))?
                        .trim();
                    headers.push(h.name.to_string(), value.to_string());
                }

                let carry_over = buf[header_len..filled].to_vec();
                return Ok((
                    Status {
                        code: code_arr,
                        reason,
                    },
                    headers,
                    carry_over,
                ));
            }
            Ok(httparse::Status::Partial) => {
                if filled == buf.len() {
                    buf.resize(buf.len() * 2, 0);
                }
                let n = socket::read_some(conn.stream_mut(), &mut buf[filled..]).await?;
                if n == 0 {
                    return Err(Error::data("unexpected EOF before response headers complete"));
                }
                filled += n;
            }
            Err(e) => return Err(Error::data(format!("malformed response: {e}"))),
        }
    }
}

/// `transfer-encoding: chunked` wins over `content-length` per spec.md §3's
/// stated invariant; absent both, the body is empty (keep-alive peers are
/// assumed to always frame their responses).
fn select_mode(headers: &HeaderList) -> Result<Mode, Error> {
    if let Some(te) = headers.get("transfer-encoding") {
        if te.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")) {
            return Ok(Mode::Chunked(ChunkState::AwaitSize));
        }
    }
    if let Some(len) = headers.get("content-length") {
        let trimmed = len.trim();
        return match trimmed.parse::<u64>() {
            Ok(n) => Ok(Mode::Identity(n)),
            Err(_) => Err(Error::data(format!("invalid content-length: {len:?}"))),
        };
    }
    Ok(Mode::Identity(0))
}

/// The lazy byte-chunk body the caller drains. Dropping a stream before it
/// reaches completion forces the connection non-reusable and closes it;
/// reaching completion (`Identity` exhaustion or chunked `Done`) releases
/// the connection back to the pool explicitly, independent of `Drop`.
pub struct BodyStream {
    pool: Pool,
    conn: Option<Connection>,
    carry_over: Vec<u8>,
    recv_bufsize: usize,
    mode: Mode,
    body_timeout: Duration,
}

impl BodyStream {
    /// Returns the next chunk, or `None` once the body is fully drained.
    /// Each read (fresh socket read, not a carry-over serve) is bounded by
    /// `body_timeout`; a stall surfaces as `Data` with a timeout cause, per
    /// spec.md §4.F's tie-break.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match crate::timeout::timeout(self.body_timeout, self.next_inner()).await {
            Ok(inner) => inner,
            Err(Error::Timeout) => {
                self.fail();
                Err(Error::data("body read timed out"))
            }
            Err(other) => {
                self.fail();
                Err(other)
            }
        }
    }

    fn fail(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, false);
        }
    }

    async fn next_inner(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.mode {
            Mode::Identity(remaining) => self.next_identity(remaining).await,
            Mode::Chunked(state) => self.next_chunked(state).await,
        }
    }

    async fn fill_carry_over(&mut self, want: usize) -> Result<(), Error> {
        if !self.carry_over.is_empty() || want == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; self.recv_bufsize.max(want).max(1)];
        let conn = self.conn.as_mut().expect("body read after completion");
        let n = socket::read_some(conn.stream_mut(), &mut buf).await?;
        if n == 0 {
            return Err(Error::data("unexpected EOF mid-body"));
        }
        buf.truncate(n);
        self.carry_over = buf;
        Ok(())
    }

    async fn next_identity(&mut self, remaining: u64) -> Result<Option<Vec<u8>>, Error> {
        if remaining == 0 {
            self.complete();
            return Ok(None);
        }
        self.fill_carry_over(1).await?;
        let want = (remaining as usize).min(self.recv_bufsize).min(self.carry_over.len().max(1));
        let take = want.min(self.carry_over.len());
        let chunk: Vec<u8> = self.carry_over.drain(..take).collect();
        let new_remaining = remaining - chunk.len() as u64;
        self.mode = Mode::Identity(new_remaining);
        if new_remaining == 0 {
            self.complete();
        }
        Ok(Some(chunk))
    }

    async fn next_chunked(&mut self, mut state: ChunkState) -> Result<Option<Vec<u8>>, Error> {
        loop {
            match state {
                ChunkState::AwaitSize => {
                    let line = self.read_line(MAX_CHUNK_SIZE_LINE).await?;
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| Error::data(format!("invalid chunk size line: {line:?}")))?;
                    state = if size == 0 {
                        ChunkState::AwaitTrailerCrlf
                    } else {
                        ChunkState::InChunk(size)
                    };
                    self.mode = Mode::Chunked(state);
                }
                ChunkState::InChunk(remaining) => {
                    self.fill_carry_over(1).await?;
                    let want = (remaining as usize).min(self.recv_bufsize).min(self.carry_over.len().max(1));
                    let take = want.min(self.carry_over.len());
                    let chunk: Vec<u8> = self.carry_over.drain(..take).collect();
                    let new_remaining = remaining - chunk.len() as u64;
                    if new_remaining == 0 {
                        self.consume_crlf().await?;
                        self.mode = Mode::Chunked(ChunkState::AwaitSize);
                    } else {
                        self.mode = Mode::Chunked(ChunkState::InChunk(new_remaining));
                    }
                    return Ok(Some(chunk));
                }
                ChunkState::AwaitTrailerCrlf => {
                    loop {
                        let line = self.read_line(MAX_CHUNK_SIZE_LINE).await?;
                        if line.is_empty() {
                            break;
                        }
                    }
                    self.mode = Mode::Chunked(ChunkState::Done);
                    self.complete();
                    return Ok(None);
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }

    /// Reads a CRLF-terminated line out of carry-over + fresh socket reads,
    /// enforcing the `max_len` safety bound from spec.md §4.F.
    async fn read_line(&mut self, max_len: usize) -> Result<String, Error> {
        loop {
            if let Some(pos) = find_crlf(&self.carry_over) {
                let line: Vec<u8> = self.carry_over.drain(..pos).collect();
                self.carry_over.drain(..2); // CRLF
                return String::from_utf8(line).map_err(|_| Error::data("non-UTF-8 chunk header line"));
            }
            if self.carry_over.len() > max_len {
                return Err(Error::data("chunk size line exceeds safety bound"));
            }
            let mut buf = vec![0u8; self.recv_bufsize.max(256)];
            let conn = self.conn.as_mut().expect("body read after completion");
            let n = socket::read_some(conn.stream_mut(), &mut buf).await?;
            if n == 0 {
                return Err(Error::data("unexpected EOF mid-chunk-framing"));
            }
            buf.truncate(n);
            self.carry_over.extend_from_slice(&buf);
        }
    }

    async fn consume_crlf(&mut self) -> Result<(), Error> {
        while self.carry_over.len() < 2 {
            let mut buf = vec![0u8; self.recv_bufsize.max(256)];
            let conn = self.conn.as_mut().expect("body read after completion");
            let n = socket::read_some(conn.stream_mut(), &mut buf).await?;
            if n == 0 {
                return Err(Error::data("unexpected EOF consuming chunk trailer CRLF"));
            }
            buf.truncate(n);
            self.carry_over.extend_from_slice(&buf);
        }
        self.carry_over.drain(..2);
        Ok(())
    }

    fn complete(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, true);
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        // Still holding a connection means the body wasn't fully drained:
        // discard it rather than risk returning a stream mid-frame to the
        // pool (spec.md §6/§9).
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, false);
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_round_trips() {
        let status = Status {
            code: *b"404",
            reason: "Not Found".into(),
        };
        assert_eq!(status.code_u16(), 404);
    }

    #[test]
    fn select_mode_prefers_chunked_over_content_length() {
        let mut headers = HeaderList::new();
        headers.push("Content-Length", "10");
        headers.push("Transfer-Encoding", "chunked");
        assert!(matches!(select_mode(&headers).unwrap(), Mode::Chunked(_)));
    }

    #[test]
    fn select_mode_defaults_to_empty_identity() {
        let headers = HeaderList::new();
        assert!(matches!(select_mode(&headers).unwrap(), Mode::Identity(0)));
    }

    #[test]
    fn select_mode_rejects_non_decimal_content_length() {
        let mut headers = HeaderList::new();
        headers.push("Content-Length", "abc");
        match select_mode(&headers) {
            Err(Error::Data(_)) => {}
            other => panic!("expected a Data error, got {other:?}"),
        }
    }

    #[test]
    fn select_mode_rejects_negative_content_length() {
        let mut headers = HeaderList::new();
        headers.push("Content-Length", "-5");
        match select_mode(&headers) {
            Err(Error::Data(_)) => {}
            other => panic!("expected a Data error, got {other:?}"),
        }
    }

    #[test]
    fn find_crlf_locates_terminator() {
        assert_eq!(find_crlf(b"abc\r\ndef"), Some(3));
        assert_eq!(find_crlf(b"no terminator"), None);
    }
}
