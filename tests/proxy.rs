//! Integration tests for the TLS intercepting proxy.
//!
//! A real proxy instance is served on an ephemeral localhost listener; the
//! test client speaks TLS 1.3 with certificate verification disabled, the
//! same stance the kiosk browser is configured with.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, Uri};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use webkiosk::proxy::{self, is_internal_request, EphemeralCa, Proxy};

/// The ephemeral proxy CA is intentionally untrusted; accept it.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

/// Starts a proxy on an ephemeral port and returns its address.
async fn start_proxy() -> SocketAddr {
    let ca = EphemeralCa::generate().expect("CA generation");
    let tls = TlsAcceptor::from(Arc::new(ca.server_config().expect("TLS config")));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let proxy = Proxy::new(false).expect("proxy handler");

    tokio::spawn(proxy::serve(
        listener,
        tls,
        proxy,
        CancellationToken::new(),
    ));

    addr
}

/// Opens a TLS session to the proxy.
async fn connect_proxy(addr: SocketAddr) -> TlsStream<TcpStream> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.expect("tcp connect");
    let name = ServerName::try_from("proxy").expect("server name");
    connector.connect(name, tcp).await.expect("tls handshake")
}

/// Reads until the end of the HTTP header block.
async fn read_headers(stream: &mut TlsStream<TcpStream>) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read header byte");
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn test_internal_connect_is_suppressed_with_504() {
    let addr = start_proxy().await;
    let mut stream = connect_proxy(addr).await;

    stream
        .write_all(
            b"CONNECT accounts.google.com:443 HTTP/1.1\r\n\
              Host: accounts.google.com:443\r\n\r\n",
        )
        .await
        .expect("write CONNECT");

    let headers = read_headers(&mut stream).await;
    assert!(
        headers.starts_with("HTTP/1.1 504"),
        "expected 504 for vendor-internal CONNECT, got:\n{headers}"
    );
}

#[tokio::test]
async fn test_connect_tunnel_bridges_both_directions() {
    // Plain TCP upper-casing echo stands in for the upstream server.
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let upstream_addr = upstream.local_addr().expect("echo addr");
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.expect("echo accept");
        let mut buf = [0u8; 64];
        loop {
            let n = conn.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            let reply: Vec<u8> = buf[..n].iter().map(u8::to_ascii_uppercase).collect();
            if conn.write_all(&reply).await.is_err() {
                return;
            }
        }
    });

    let addr = start_proxy().await;
    let mut stream = connect_proxy(addr).await;

    let connect = format!(
        "CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("write CONNECT");

    let headers = read_headers(&mut stream).await;
    assert!(
        headers.starts_with("HTTP/1.1 200"),
        "expected 200 for permitted CONNECT, got:\n{headers}"
    );

    stream.write_all(b"hello tunnel").await.expect("write payload");
    let mut reply = [0u8; 12];
    stream
        .read_exact(&mut reply)
        .await
        .expect("read echoed payload");
    assert_eq!(&reply, b"HELLO TUNNEL");
}

#[tokio::test]
async fn test_passthrough_streams_response_and_closes() {
    // Minimal HTTP/1.1 origin server.
    let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_addr = origin.local_addr().expect("origin addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = origin.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = conn.read(&mut buf).await;
                let _ = conn
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\
                          X-Origin: yes\r\n\r\nhello",
                    )
                    .await;
            });
        }
    });

    let addr = start_proxy().await;
    let mut stream = connect_proxy(addr).await;

    let request = format!(
        "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write GET");

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read response to close");
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "got:\n{response}");
    assert!(response.to_lowercase().contains("connection: close"));
    assert!(response.to_lowercase().contains("x-origin: yes"));
    // The re-streamed body has no Content-Length; it arrives chunked.
    assert!(!response.to_lowercase().contains("content-length"));
    assert!(response.contains("hello"), "body missing:\n{response}");
}

#[tokio::test]
async fn test_upstream_dial_failure_maps_to_502() {
    let addr = start_proxy().await;
    let mut stream = connect_proxy(addr).await;

    // A listener that is immediately dropped yields a refused port.
    let refused = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let refused_addr = refused.local_addr().expect("addr");
    drop(refused);

    let connect = format!(
        "CONNECT {refused_addr} HTTP/1.1\r\nHost: {refused_addr}\r\n\r\n"
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("write CONNECT");

    let headers = read_headers(&mut stream).await;
    assert!(
        headers.starts_with("HTTP/1.1 502"),
        "expected 502 for refused upstream, got:\n{headers}"
    );
}

#[test]
fn test_classifier_truth_table() {
    let cases: &[(bool, &str, &str)] = &[
        (true, "CONNECT", "accounts.google.com:443"),
        (true, "CONNECT", "content-autofill.googleapis.com:443"),
        (true, "CONNECT", "optimizationguide-pa.googleapis.com:443"),
        (true, "CONNECT", "safebrowsingohttpgateway.googleapis.com:443"),
        (true, "CONNECT", "update.googleapis.com:443"),
        (true, "CONNECT", "www.google.com:443"),
        (true, "GET", "http://clients2.google.com/time/1/current?"),
        (true, "GET", "http://clients2.google.com/time/1/current?foo&bar&quux"),
        (true, "POST", "http://update.googleapis.com/service/update2/json?x"),
        (false, "GET", "http://google.com/"),
        (false, "GET", "https://google.com/"),
        (false, "GET", "https://example.com/"),
        (false, "CONNECT", "example.com:443"),
    ];

    for (expect, method, uri) in cases {
        let method: Method = method.parse().expect("method");
        let uri: Uri = uri.parse().expect("uri");
        assert_eq!(
            is_internal_request(&method, &uri),
            *expect,
            "mismatch for {method} {uri}"
        );
    }
}
