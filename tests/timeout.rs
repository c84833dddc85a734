mod support;

use httpflow::{Body, Client, Error, HeaderList, Method, PoolConfig, Runtime};
use std::time::Duration;

#[test]
fn stalled_response_headers_time_out_as_a_data_error() {
    let (listener, addr) = support::listener();
    support::serve(listener, |mut stream, _idx| {
        support::read_request_head(&mut stream);
        std::thread::sleep(Duration::from_millis(300));
        support::write_all(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    });

    let mut config = PoolConfig::default();
    config.request_timeout = Duration::from_millis(40);
    let client = Client::new(config);
    let rt = Runtime::new().unwrap();

    let result = rt.block_on(client.request(
        Method::Get,
        &format!("http://{addr}/"),
        &[],
        &HeaderList::new(),
        Body::Empty,
    ));

    match result {
        Ok(_) => panic!("expected the stalled response to time out"),
        Err(Error::Data(msg)) => assert!(msg.contains("timed out"), "unexpected message: {msg}"),
        Err(other) => panic!("expected a Data timeout error, got {other:?}"),
    }
}

#[test]
fn stalled_body_times_out_independent_of_the_header_deadline() {
    let (listener, addr) = support::listener();
    support::serve(listener, |mut stream, _idx| {
        support::read_request_head(&mut stream);
        // Headers arrive promptly, announcing a body that never actually
        // shows up within body_timeout.
        support::write_all(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");
        std::thread::sleep(Duration::from_millis(300));
    });

    let mut config = PoolConfig::default();
    config.request_timeout = Duration::from_secs(5);
    config.body_timeout = Duration::from_millis(40);
    let client = Client::new(config);
    let rt = Runtime::new().unwrap();

    let result = rt.block_on(async {
        let (status, _headers, mut stream) = client
            .request(Method::Get, &format!("http://{addr}/"), &[], &HeaderList::new(), Body::Empty)
            .await?;
        assert_eq!(status.code_u16(), 200);
        stream.next().await
    });

    match result {
        Ok(_) => panic!("expected the stalled body read to time out"),
        Err(Error::Data(msg)) => assert!(msg.contains("timed out"), "unexpected message: {msg}"),
        Err(other) => panic!("expected a Data timeout error, got {other:?}"),
    }
}
