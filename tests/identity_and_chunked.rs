mod support;

use httpflow::{Body, Client, Error, HeaderList, Method, PoolConfig, Runtime};

#[test]
fn identity_body_round_trips_across_recv_bufsizes() {
    for recv_bufsize in [8usize, 64, 16384] {
        let (listener, addr) = support::listener();
        support::serve(listener, |mut stream, _idx| {
            support::read_request_head(&mut stream);
            let body = b"hello world, this is a moderately sized response body";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            support::write_all(&mut stream, response.as_bytes());
            support::write_all(&mut stream, body);
        });

        let mut config = PoolConfig::default();
        config.recv_bufsize = recv_bufsize;
        let client = Client::new(config);
        let rt = Runtime::new().unwrap();

        let (status, _headers, buf) = rt
            .block_on(client.buffered(
                Method::Get,
                &format!("http://{addr}/"),
                &[],
                &HeaderList::new(),
                Body::Empty,
            ))
            .unwrap_or_else(|e| panic!("recv_bufsize={recv_bufsize}: request failed: {e}"));

        assert_eq!(status.code_u16(), 200);
        assert_eq!(buf, b"hello world, this is a moderately sized response body");
    }
}

#[test]
fn chunked_body_round_trips_across_recv_bufsizes() {
    for recv_bufsize in [8usize, 64, 4096] {
        let (listener, addr) = support::listener();
        support::serve(listener, |mut stream, _idx| {
            support::read_request_head(&mut stream);
            support::write_all(
                &mut stream,
                b"HTTP/1.1 200 OK\r\n\
                  Transfer-Encoding: chunked\r\n\
                  \r\n\
                  5\r\nhello\r\n\
                  6\r\n world\r\n\
                  0\r\n\r\n",
            );
        });

        let mut config = PoolConfig::default();
        config.recv_bufsize = recv_bufsize;
        let client = Client::new(config);
        let rt = Runtime::new().unwrap();

        let (status, headers, buf) = rt
            .block_on(client.buffered(
                Method::Get,
                &format!("http://{addr}/"),
                &[],
                &HeaderList::new(),
                Body::Empty,
            ))
            .unwrap_or_else(|e| panic!("recv_bufsize={recv_bufsize}: request failed: {e}"));

        assert_eq!(status.code_u16(), 200);
        assert_eq!(headers.get("transfer-encoding"), Some("chunked"));
        assert_eq!(buf, b"hello world");
    }
}

#[test]
fn chunked_takes_precedence_over_a_conflicting_content_length() {
    let (listener, addr) = support::listener();
    support::serve(listener, |mut stream, _idx| {
        support::read_request_head(&mut stream);
        support::write_all(
            &mut stream,
            b"HTTP/1.1 200 OK\r\n\
              Content-Length: 999\r\n\
              Transfer-Encoding: chunked\r\n\
              \r\n\
              2\r\nhi\r\n\
              0\r\n\r\n",
        );
    });

    let client = Client::new(PoolConfig::default());
    let rt = Runtime::new().unwrap();

    let (status, _headers, buf) = rt
        .block_on(client.buffered(
            Method::Get,
            &format!("http://{addr}/"),
            &[],
            &HeaderList::new(),
            Body::Empty,
        ))
        .expect("request should succeed");

    assert_eq!(status.code_u16(), 200);
    assert_eq!(buf, b"hi");
}

#[test]
fn malformed_content_length_is_a_data_error() {
    let (listener, addr) = support::listener();
    support::serve(listener, |mut stream, _idx| {
        support::read_request_head(&mut stream);
        support::write_all(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Length: -5\r\n\r\n");
    });

    let client = Client::new(PoolConfig::default());
    let rt = Runtime::new().unwrap();

    let result = rt.block_on(client.buffered(
        Method::Get,
        &format!("http://{addr}/"),
        &[],
        &HeaderList::new(),
        Body::Empty,
    ));

    match result {
        Ok(_) => panic!("expected a negative content-length to be rejected"),
        Err(Error::Data(msg)) => assert!(msg.contains("content-length"), "unexpected message: {msg}"),
        Err(other) => panic!("expected a Data error, got {other:?}"),
    }
}
