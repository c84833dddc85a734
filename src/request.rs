//! HTTP/1.1 request serializer (spec component E).
//!
//! The caller controls every framing header: this module never injects
//! `Host`, `Content-Length`, `Transfer-Encoding`, or `Connection`. It only
//! composes the request line (with percent-encoded query parameters) and
//! writes headers and body verbatim.

use crate::error::Error;
use crate::pool::Connection;
use crate::socket;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Connect,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
        }
    }
}

/// A name/value header list preserving insertion order and allowing
/// duplicate names, matching raw HTTP/1.1 header semantics.
#[derive(Debug, Clone, Default)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

use std::io;

/// The two body shapes spec.md §4.E/§4.G names: a single in-memory buffer
/// (`buffered`) or an externally driven chunk source (`streamed`).
pub enum Body {
    Empty,
    Buffered(Vec<u8>),
    Streamed(Box<dyn ChunkSource>),
}

/// An externally driven chunk source for [`Body::Streamed`]. Poll-based
/// rather than `async fn` so it stays object-safe behind `Box<dyn ChunkSource>`.
pub trait ChunkSource: Send {
    fn poll_next_chunk(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<Option<Vec<u8>>>>;
}

impl Body {
    /// Convenience adapter: wraps a single byte buffer as a one-shot body.
    pub fn buffered(bytes: impl Into<Vec<u8>>) -> Self {
        Body::Buffered(bytes.into())
    }

    /// Convenience adapter: wraps an externally driven chunk source.
    pub fn streamed(source: impl ChunkSource + 'static) -> Self {
        Body::Streamed(Box::new(source))
    }

    async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            Body::Empty => Ok(None),
            Body::Buffered(buf) => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(buf)))
                }
            }
            Body::Streamed(source) => {
                std::future::poll_fn(|cx| source.poll_next_chunk(cx)).await
            }
        }
    }
}

/// Percent-encodes everything outside `A-Za-z0-9-_.~`, matching the set
/// `url`'s own `form_urlencoded` uses for query components.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Composes `path[?query]` from a base path and a caller-supplied parameter
/// list (spec.md §4.E step 1).
pub fn compose_target(path: &str, params: &[(String, String)]) -> String {
    let path = if path.is_empty() { "/" } else { path };
    if params.is_empty() {
        return path.to_string();
    }
    let mut target = String::with_capacity(path.len() + 16);
    target.push_str(path);
    target.push('?');
    for (i, (k, v)) in params.iter().enumerate() {
        if i > 0 {
            target.push('&');
        }
        target.push_str(&percent_encoding::utf8_percent_encode(k, QUERY_ENCODE_SET).to_string());
        target.push('=');
        target.push_str(&percent_encoding::utf8_percent_encode(v, QUERY_ENCODE_SET).to_string());
    }
    target
}

/// Serializes and writes a full request (line, headers, body) onto `conn`,
/// under `request_timeout` for the whole operation (spec.md §4.E's final
/// paragraph: a stalled write beyond the deadline surfaces as a protocol
/// `Data` error, distinct from the public timeout-scope primitive in
/// `timeout.rs`).
pub async fn write_request(
    conn: &mut Connection,
    method: Method,
    target: &str,
    headers: &HeaderList,
    mut body: Body,
    request_timeout: Duration,
) -> Result<(), Error> {
    let mut head = String::with_capacity(128);
    head.push_str(method.as_str());
    head.push(' ');
    head.push_str(target);
    head.push_str(" HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let fut = async {
        socket::write_all(conn.stream_mut(), head.as_bytes()).await?;
        while let Some(chunk) = body
            .next_chunk()
            .await
            .map_err(|e| Error::data(e.to_string()))?
        {
            socket::write_all(conn.stream_mut(), &chunk).await?;
        }
        Ok::<(), Error>(())
    };

    match crate::timeout::timeout(request_timeout, fut).await {
        Ok(result) => result,
        Err(Error::Timeout) => Err(Error::data("request write timed out")),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_target_without_params() {
        assert_eq!(compose_target("/foo", &[]), "/foo");
        assert_eq!(compose_target("", &[]), "/");
    }

    #[test]
    fn compose_target_encodes_params() {
        let params = vec![("q".to_string(), "a b/c".to_string())];
        assert_eq!(compose_target("/search", &params), "/search?q=a%20b%2Fc");
    }

    #[test]
    fn header_list_preserves_order_and_duplicates() {
        let mut headers = HeaderList::new();
        headers.push("X-A", "1").push("X-A", "2");
        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("X-A", "1"), ("X-A", "2")]);
    }
}
