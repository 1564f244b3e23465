//! Integration tests for mirrorproxy
//!
//! Covers the full proxy path end to end:
//! - director rewriting (host, path join, query merge)
//! - header and body domain substitution in both directions
//! - hop-by-hop stripping
//! - gzip transcoding against the client's Accept-Encoding
//! - CONNECT tunneling
//! - upstream failure and unmapped-host handling
//! - the TLS-mode challenge/redirect listener
//!
//! Requests are written over raw sockets where the Host header or the CONNECT
//! byte stream matters; reqwest covers the listener-level cases.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use mirrorproxy::{CertificateManager, MappingTable, ProxyConfig, ProxyServer};
use std::convert::Infallible;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

struct TestProxy {
    http_port: u16,
    cert_manager: Arc<CertificateManager>,
    _certs_dir: TempDir,
}

/// Start a proxy with the given mappings and wait until it accepts.
async fn start_proxy(pairs: &[(&str, String)], enable_tls: bool) -> TestProxy {
    let table = Arc::new(
        MappingTable::new(
            pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.clone())),
        )
        .unwrap(),
    );

    let certs_dir = tempdir().unwrap();
    let policy_table = Arc::clone(&table);
    let cert_manager = Arc::new(
        CertificateManager::new(
            certs_dir.path(),
            Arc::new(move |host: &str| policy_table.is_host_allowed(host)),
        )
        .unwrap(),
    );

    let http_port = get_unique_port();
    let https_port = get_unique_port();
    let config = ProxyConfig {
        http_addr: ([127, 0, 0, 1], http_port).into(),
        https_addr: ([127, 0, 0, 1], https_port).into(),
        enable_tls,
        ..ProxyConfig::default()
    };

    let server = Arc::new(ProxyServer::new(config, table, Arc::clone(&cert_manager)));
    tokio::spawn(server.run());
    sleep(Duration::from_millis(150)).await;

    TestProxy {
        http_port,
        cert_manager,
        _certs_dir: certs_dir,
    }
}

/// Backend that echoes the request line details and sets response headers the
/// proxy is expected to strip or rewrite.
async fn run_echo_backend(port: u16) {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let xff = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let hop = req.headers().contains_key("x-hop");

                    let body = format!(
                        "path={}|query={}|host={}|xff={}|hop={}",
                        req.uri().path(),
                        req.uri().query().unwrap_or("-"),
                        host,
                        xff,
                        hop
                    );

                    let response = Response::builder()
                        .status(200)
                        .header("proxy-authenticate", "Basic")
                        .header("keep-alive", "timeout=5")
                        .header("location", format!("http://{}/login", host))
                        .body(Full::new(Bytes::from(body)))
                        .unwrap();
                    Ok::<_, Infallible>(response)
                });

                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    sleep(Duration::from_millis(50)).await;
}

/// TCP server echoing every byte back, for tunnel tests.
async fn run_tcp_echo(port: u16) {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    sleep(Duration::from_millis(50)).await;
}

/// Send a raw HTTP/1.1 request and read the whole response. The request must
/// carry `Connection: close` so the read terminates.
async fn send_raw(port: u16, request: String) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();

    let pos = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
    let body = buf[pos + 4..].to_vec();

    let status: u16 = head
        .lines()
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();

    (status, head, body)
}

/// Open a CONNECT tunnel and return the stream plus the response head.
async fn open_tunnel(proxy_port: u16, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before response head completed");
        head.push(byte[0]);
    }

    (stream, String::from_utf8_lossy(&head).to_string())
}

#[tokio::test]
async fn test_proxy_rewrites_host_path_query_and_body() {
    let backend_port = get_unique_port();
    run_echo_backend(backend_port).await;

    let proxy = start_proxy(
        &[(
            "t.example.com",
            format!("http://127.0.0.1:{}/base?x=10", backend_port),
        )],
        false,
    )
    .await;

    let (status, head, body) = send_raw(
        proxy.http_port,
        "GET /a?b=1 HTTP/1.1\r\nHost: t.example.com\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;

    assert_eq!(status, 200);

    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("path=/base/a"), "body: {}", body);
    assert!(body.contains("query=x=10&b=1"), "body: {}", body);
    // The backend saw the target authority; the reverse body substitution
    // turns it back into the access host on the way out.
    assert!(body.contains("host=t.example.com"), "body: {}", body);
    assert!(body.contains("xff=127.0.0.1"), "body: {}", body);

    // Content-Length reflects the rewritten body, not the upstream one.
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(content_length, body.len());
}

#[tokio::test]
async fn test_hop_by_hop_request_headers_not_forwarded() {
    let backend_port = get_unique_port();
    run_echo_backend(backend_port).await;

    let proxy = start_proxy(
        &[("t.example.com", format!("http://127.0.0.1:{}", backend_port))],
        false,
    )
    .await;

    // x-hop is hop-by-hop by virtue of being listed in Connection.
    let (status, _, body) = send_raw(
        proxy.http_port,
        "GET / HTTP/1.1\r\nHost: t.example.com\r\nX-Hop: 1\r\nTe: trailers\r\n\
         Connection: x-hop, close\r\n\r\n"
            .to_string(),
    )
    .await;

    assert_eq!(status, 200);
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("hop=false"), "body: {}", body);
}

#[tokio::test]
async fn test_response_headers_stripped_and_rewritten() {
    let backend_port = get_unique_port();
    run_echo_backend(backend_port).await;

    let proxy = start_proxy(
        &[("t.example.com", format!("http://127.0.0.1:{}", backend_port))],
        false,
    )
    .await;

    let (status, head, _) = send_raw(
        proxy.http_port,
        "GET / HTTP/1.1\r\nHost: t.example.com\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;

    assert_eq!(status, 200);
    assert!(!head.contains("proxy-authenticate"), "head: {}", head);
    assert!(!head.contains("keep-alive"), "head: {}", head);
    // The backend pointed at itself; the client sees the access host.
    assert!(
        head.contains("location: http://t.example.com/login"),
        "head: {}",
        head
    );
}

#[tokio::test]
async fn test_gzip_body_reencoded_for_gzip_client() {
    let mock_server = MockServer::start().await;
    let upstream_authority = mock_server.address().to_string();

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_bytes(gzip(
                    format!("see http://{}/next", upstream_authority).as_bytes(),
                )),
        )
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(
        &[("t.example.com", format!("http://{}", upstream_authority))],
        false,
    )
    .await;

    let (status, head, body) = send_raw(
        proxy.http_port,
        "GET /page HTTP/1.1\r\nHost: t.example.com\r\nAccept-Encoding: gzip\r\n\
         Connection: close\r\n\r\n"
            .to_string(),
    )
    .await;

    assert_eq!(status, 200);
    assert!(head.contains("content-encoding: gzip"), "head: {}", head);
    assert_eq!(gunzip(&body), b"see http://t.example.com/next");
}

#[tokio::test]
async fn test_gzip_body_decoded_for_plain_client() {
    let mock_server = MockServer::start().await;
    let upstream_authority = mock_server.address().to_string();

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_bytes(gzip(
                    format!("see http://{}/next", upstream_authority).as_bytes(),
                )),
        )
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(
        &[("t.example.com", format!("http://{}", upstream_authority))],
        false,
    )
    .await;

    let (status, head, body) = send_raw(
        proxy.http_port,
        "GET /page HTTP/1.1\r\nHost: t.example.com\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;

    assert_eq!(status, 200);
    assert!(!head.contains("content-encoding"), "head: {}", head);
    assert_eq!(body, b"see http://t.example.com/next");
}

#[tokio::test]
async fn test_unmapped_host_gets_502() {
    let proxy = start_proxy(
        &[("t.example.com", "http://127.0.0.1:1".to_string())],
        false,
    )
    .await;

    let (status, _, body) = send_raw(
        proxy.http_port,
        "GET / HTTP/1.1\r\nHost: unknown.example.org\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;

    assert_eq!(status, 502);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_upstream_connection_refused_gets_502() {
    // Nothing listens on the target port.
    let closed_port = get_unique_port();
    let proxy = start_proxy(
        &[(
            "t.example.com",
            format!("http://127.0.0.1:{}", closed_port),
        )],
        false,
    )
    .await;

    let (status, _, body) = send_raw(
        proxy.http_port,
        "GET / HTTP/1.1\r\nHost: t.example.com\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;

    assert_eq!(status, 502);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_connect_tunnel_round_trip() {
    let echo_port = get_unique_port();
    run_tcp_echo(echo_port).await;

    let proxy = start_proxy(
        &[("127.0.0.1", format!("http://127.0.0.1:{}", echo_port))],
        false,
    )
    .await;

    let authority = format!("127.0.0.1:{}", echo_port);
    let (mut stream, head) = open_tunnel(proxy.http_port, &authority).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {}", head);

    stream.write_all(b"hello tunnel").await.unwrap();
    let mut echoed = [0u8; 12];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello tunnel");

    stream.write_all(b"more bytes").await.unwrap();
    let mut echoed = [0u8; 10];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"more bytes");
}

#[tokio::test]
async fn test_connect_to_unmapped_host_refused() {
    let proxy = start_proxy(
        &[("t.example.com", "http://127.0.0.1:1".to_string())],
        false,
    )
    .await;

    let (_, head) = open_tunnel(proxy.http_port, "unmapped.example.org:443").await;
    assert!(head.starts_with("HTTP/1.1 502"), "head: {}", head);
}

#[tokio::test]
async fn test_connect_dial_failure_drops_connection() {
    let closed_port = get_unique_port();
    let proxy = start_proxy(
        &[("127.0.0.1", "http://127.0.0.1:1".to_string())],
        false,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.http_port))
        .await
        .unwrap();
    stream
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{closed_port} HTTP/1.1\r\nHost: 127.0.0.1:{closed_port}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Nothing is written; the client just sees the connection close.
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty(), "unexpected bytes: {:?}", buf);
}

#[tokio::test]
async fn test_challenge_and_redirect_listener() {
    let proxy = start_proxy(
        &[("t.example.com", "http://127.0.0.1:1".to_string())],
        true,
    )
    .await;

    proxy
        .cert_manager
        .store_acme_challenge("test-token", "test-token.abc123");

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = client
        .get(format!(
            "http://127.0.0.1:{}/.well-known/acme-challenge/test-token",
            proxy.http_port
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "test-token.abc123");

    let response = client
        .get(format!(
            "http://127.0.0.1:{}/.well-known/acme-challenge/missing",
            proxy.http_port
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(format!("http://127.0.0.1:{}/x?y=1", proxy.http_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 302);
    assert_eq!(
        response.headers().get("location").unwrap(),
        &format!("https://127.0.0.1:{}/x?y=1", proxy.http_port)
    );
}
