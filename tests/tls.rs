mod support;

use httpflow::{Body, Client, Error, HeaderList, Method, PoolConfig, Runtime, TlsConnector};
use rustls::pki_types::CertificateDer;
use std::io::{Read, Write};
use std::sync::Arc;

/// Generates a throwaway self-signed certificate for `localhost` and spins
/// up a single-connection TLS echo-response server on a background thread.
/// Returns the server's address and the certificate's PEM encoding, which
/// tests feed to [`TlsConnector::with_ca_pem`] to trust it explicitly.
fn spawn_tls_server(response: &'static [u8]) -> (std::net::SocketAddr, String) {
    let cert_key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed certificate");
    let cert_pem = cert_key.cert.pem();
    let cert_der = CertificateDer::from(cert_key.cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(cert_key.key_pair.serialize_der())
        .expect("encode private key");

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("build server TLS config");
    let server_config = Arc::new(server_config);

    let (listener, addr) = support::listener();
    std::thread::spawn(move || {
        let Ok((sock, _)) = listener.accept() else { return };
        let conn = rustls::ServerConnection::new(server_config).expect("server TLS connection");
        let mut tls = rustls::StreamOwned::new(conn, sock);

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if tls.read_exact(&mut byte).is_err() {
                return;
            }
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let _ = tls.write_all(response);
        let _ = tls.flush();
    });

    (addr, cert_pem)
}

#[test]
fn default_trust_store_rejects_self_signed_peer() {
    let (addr, _cert_pem) = spawn_tls_server(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

    let client = Client::new(PoolConfig::default());
    let rt = Runtime::new().unwrap();

    let result = rt.block_on(client.request(
        Method::Get,
        &format!("https://localhost:{}/", addr.port()),
        &[],
        &HeaderList::new(),
        Body::Empty,
    ));

    match result {
        Ok(_) => panic!("expected TLS handshake against an untrusted self-signed peer to fail"),
        Err(Error::Tls(_)) => {}
        Err(other) => panic!("expected a TLS trust failure, got {other:?}"),
    }
}

#[test]
fn connector_trusts_a_caller_supplied_ca_bundle() {
    let (addr, cert_pem) =
        spawn_tls_server(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

    let tls = TlsConnector::with_ca_pem(cert_pem.as_bytes()).expect("parse CA bundle");
    let client = Client::with_tls(PoolConfig::default(), tls);
    let rt = Runtime::new().unwrap();

    let (status, _headers, buf) = rt
        .block_on(client.buffered(
            Method::Get,
            &format!("https://localhost:{}/", addr.port()),
            &[],
            &HeaderList::new(),
            Body::Empty,
        ))
        .expect("request over trusted TLS should succeed");

    assert_eq!(status.code_u16(), 200);
    assert_eq!(buf, b"hello");
}
