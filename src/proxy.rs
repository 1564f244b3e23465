//! Proxy server implementation
//! Runs the listeners and the per-request rewrite pipeline, plus the raw
//! CONNECT tunnel path.

use crate::certificate::CertificateManager;
use crate::compression::{CompressionAdapter, EncodingAction};
use crate::error::ProxyError;
use crate::mapping::{Direction, MappingTable};
use crate::rewrite;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Either, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{
    HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, TRAILER,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Body type for client-facing responses and upstream requests.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Optional hook over the rewritten upstream response head; an error here
/// turns the response into a Bad Gateway.
pub type ResponseHook =
    Box<dyn Fn(&mut hyper::http::response::Parts) -> anyhow::Result<()> + Send + Sync>;

/// Upstream request body: either the streamed inbound body or nothing at all.
type UpstreamBody = Either<Empty<Bytes>, Incoming>;

type UpstreamClient = Client<HttpsConnector<HttpConnector>, UpstreamBody>;

/// Proxy server configuration, built once at startup and immutable afterward.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub enable_tls: bool,
    /// Hard deadline over a whole CONNECT tunnel session.
    pub tunnel_timeout: Duration,
    /// Upstream TCP dial timeout.
    pub connect_timeout: Duration,
    /// How long pooled upstream connections may sit idle.
    pub pool_idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            https_addr: ([0, 0, 0, 0], 8443).into(),
            enable_tls: false,
            tunnel_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// The reverse proxy engine and its listeners.
pub struct ProxyServer {
    config: ProxyConfig,
    table: Arc<MappingTable>,
    cert_manager: Arc<CertificateManager>,
    client: UpstreamClient,
    response_hook: Option<ResponseHook>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        table: Arc<MappingTable>,
        cert_manager: Arc<CertificateManager>,
    ) -> Self {
        let client = build_client(&config);
        Self {
            config,
            table,
            cert_manager,
            client,
            response_hook: None,
        }
    }

    /// Install a hook that may adjust or veto the rewritten response head.
    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.response_hook = Some(hook);
        self
    }

    pub fn mapping_table(&self) -> &Arc<MappingTable> {
        &self.table
    }

    /// Run the configured listeners until one of them fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("{} mappings configured", self.table.len());

        if self.config.enable_tls {
            let challenge = tokio::spawn(Arc::clone(&self).run_challenge_server());
            let https = tokio::spawn(Arc::clone(&self).run_https_server());
            let (challenge, https) = tokio::try_join!(challenge, https)?;
            challenge?;
            https?;
            Ok(())
        } else {
            self.run_http_server().await
        }
    }

    /// Plain-HTTP mode: the proxy handler serves the HTTP listener directly.
    async fn run_http_server(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.http_addr)
            .await
            .with_context(|| format!("binding {}", self.config.http_addr))?;
        info!("HTTP proxy listening on {}", self.config.http_addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req, remote_addr).await }
                });

                if let Err(err) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!(%remote_addr, %err, "connection ended with error");
                }
            });
        }
    }

    /// TLS mode: terminate TLS with per-host certificates and run the same
    /// proxy handler over the decrypted stream.
    async fn run_https_server(self: Arc<Self>) -> Result<()> {
        let acceptor = TlsAcceptor::from(self.cert_manager.server_config());
        let listener = TcpListener::bind(self.config.https_addr)
            .await
            .with_context(|| format!("binding {}", self.config.https_addr))?;
        info!("HTTPS proxy listening on {}", self.config.https_addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let acceptor = acceptor.clone();
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(%remote_addr, %err, "tls handshake failed");
                        return;
                    }
                };

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req, remote_addr).await }
                });

                if let Err(err) = http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!(%remote_addr, %err, "connection ended with error");
                }
            });
        }
    }

    /// TLS mode companion listener on the plain-HTTP address: answers HTTP-01
    /// challenges and redirects everything else to HTTPS.
    async fn run_challenge_server(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.http_addr)
            .await
            .with_context(|| format!("binding {}", self.config.http_addr))?;
        info!("challenge/redirect listener on {}", self.config.http_addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_challenge(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(%remote_addr, %err, "connection ended with error");
                }
            });
        }
    }

    /// Entry point for every request on a proxy listener.
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        info!(
            "{} {} {} {}",
            remote_addr,
            req.method(),
            req.headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-"),
            req.uri()
        );

        if req.method() == Method::CONNECT {
            return match self.tunnel_request(req).await {
                Ok(response) => Ok(response),
                Err(err @ ProxyError::TunnelDial { .. }) => {
                    warn!(%err, "aborting tunnel");
                    // Propagating the error makes hyper drop the connection
                    // without writing anything further.
                    Err(err)
                }
                Err(err) => {
                    warn!(%err, "refusing tunnel");
                    Ok(error_response(err.status()))
                }
            };
        }

        match self.proxy_request(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(%err, "proxy error");
                Ok(error_response(err.status()))
            }
        }
    }

    /// The rewrite pipeline for everything that is not a CONNECT.
    async fn proxy_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let host = request_host(&req).ok_or(ProxyError::MissingHost)?;
        let mapping = self
            .table
            .resolve(&host)
            .ok_or_else(|| ProxyError::NoMapping { host: host.clone() })?
            .clone();

        let (mut parts, body) = req.into_parts();
        let client_headers = parts.headers.clone();

        // A known-empty body goes out as no body at all, so the pooled
        // transport can safely replay the request on a dead idle connection.
        let outbound_body: UpstreamBody = if body.size_hint().exact() == Some(0) {
            Either::Left(Empty::new())
        } else {
            Either::Right(body)
        };

        rewrite::direct(&mut parts, &mapping, &host)?;
        rewrite::strip_hop_by_hop(&mut parts.headers);
        mapping.rewrite_headers(&mut parts.headers, Direction::Forward);
        rewrite::append_forwarded_for(&mut parts.headers, remote_addr.ip());

        let method = parts.method.clone();
        let target = parts.uri.clone();
        let outbound = Request::from_parts(parts, outbound_body);

        let upstream = self.client.request(outbound).await.map_err(|err| {
            error!(%method, %host, upstream = %target, %err, "upstream round trip failed");
            ProxyError::Upstream(err)
        })?;

        let (mut res_parts, res_body) = upstream.into_parts();

        rewrite::strip_hop_by_hop(&mut res_parts.headers);
        mapping.rewrite_headers(&mut res_parts.headers, Direction::Reverse);

        if let Some(hook) = &self.response_hook {
            hook(&mut res_parts).map_err(|err| {
                error!(%method, %host, upstream = %target, %err, "response hook failed");
                ProxyError::ResponseHook(err)
            })?;
        }

        // Substitution needs the whole text, so bodies are materialized in
        // memory; a failed read degrades to an empty body instead of killing
        // a response whose headers are already committed.
        let (raw, trailers) = match res_body.collect().await {
            Ok(collected) => {
                let trailers = collected.trailers().cloned();
                (collected.to_bytes(), trailers)
            }
            Err(err) => {
                warn!(%method, %host, upstream = %target, %err, "upstream body read failed, sending empty body");
                (Bytes::new(), None)
            }
        };

        let mut adapter = CompressionAdapter::new(&client_headers, &res_parts.headers);
        let decoded = adapter.decode(&raw);
        let rewritten = if adapter.is_opaque() {
            decoded
        } else {
            mapping.substitute_bytes(Direction::Reverse, &decoded)
        };
        let body_bytes = Bytes::from(adapter.encode(rewritten));

        if adapter.header_action() == EncodingAction::Strip {
            res_parts.headers.remove(CONTENT_ENCODING);
        }
        // Recomputed from the rewritten body.
        res_parts.headers.remove(CONTENT_LENGTH);

        match trailers {
            Some(trailers) if !trailers.is_empty() => {
                let names = trailers
                    .keys()
                    .map(|name| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = HeaderValue::from_str(&names) {
                    res_parts.headers.append(TRAILER, value);
                }

                // No length on a trailer-bearing response: chunked framing is
                // what carries the trailer frame to the client.
                let frames = vec![
                    Ok::<_, hyper::Error>(Frame::data(body_bytes)),
                    Ok(Frame::trailers(trailers)),
                ];
                let body = StreamBody::new(stream::iter(frames)).boxed();
                Ok(Response::from_parts(res_parts, body))
            }
            _ => Ok(Response::from_parts(res_parts, full_body(body_bytes))),
        }
    }

    /// CONNECT path: check the mapping policy, dial the literal authority,
    /// then hand the connection over to a raw bidirectional pump.
    async fn tunnel_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or(ProxyError::MissingHost)?;

        // The allow policy applies to tunnels too; the dial target stays the
        // literal requested authority.
        if self.table.resolve(authority.host()).is_none() {
            return Err(ProxyError::NoMapping {
                host: authority.host().to_string(),
            });
        }

        let upstream = TcpStream::connect(authority.as_str())
            .await
            .map_err(|source| ProxyError::TunnelDial {
                authority: authority.to_string(),
                source,
            })?;

        let peer = authority.to_string();
        let deadline = self.config.tunnel_timeout;
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(err) = tunnel(upgraded, upstream, deadline).await {
                        warn!(%peer, %err, "tunnel closed with error");
                    }
                }
                Err(err) => warn!(%peer, %err, "client connection cannot be tunneled"),
            }
        });

        // hyper writes the 200 status line and performs the upgrade once this
        // response goes out.
        Ok(Response::new(empty_body()))
    }

    /// Challenge/redirect service for the plain listener in TLS mode.
    async fn handle_challenge(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if let Some(token) = req
            .uri()
            .path()
            .strip_prefix("/.well-known/acme-challenge/")
        {
            return Ok(match self.cert_manager.acme_challenge(token) {
                Some(key_authorization) => text_response(StatusCode::OK, &key_authorization),
                None => error_response(StatusCode::NOT_FOUND),
            });
        }

        let host = match request_host(&req) {
            Some(host) => host,
            None => return Ok(error_response(StatusCode::BAD_REQUEST)),
        };

        let location = match req.uri().query() {
            Some(query) => format!("https://{}{}?{}", host, req.uri().path(), query),
            None => format!("https://{}{}", host, req.uri().path()),
        };
        Ok(redirect_response(&location))
    }
}

/// Raw bidirectional pump between the upgraded client stream and the dialed
/// upstream, bounded by one shared deadline. Both halves are shut down on
/// every exit path.
async fn tunnel(
    upgraded: Upgraded,
    mut upstream: TcpStream,
    deadline: Duration,
) -> std::io::Result<()> {
    let mut client = TokioIo::new(upgraded);

    let result = tokio::time::timeout(deadline, copy_bidirectional(&mut client, &mut upstream))
        .await;

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    match result {
        Ok(Ok((to_upstream, to_client))) => {
            debug!(to_upstream, to_client, "tunnel finished");
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "tunnel deadline elapsed",
        )),
    }
}

/// Pooled upstream client: HTTP/1.1 only, rustls with webpki roots, bounded
/// dial and idle times. Compression is never negotiated here; the engine
/// forces `Accept-Encoding` itself and transcodes on the return path.
fn build_client(config: &ProxyConfig) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));
    connector.enforce_http(false);

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(100)
        .build(https)
}

/// The host a request is addressed to: `Host` header first, URI authority as
/// the fallback for absolute-form requests.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Error responses carry no body; the detail stays in the logs.
fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn redirect_response(location: &str) -> Response<ProxyBody> {
    let value = match HeaderValue::from_str(location) {
        Ok(value) => value,
        Err(_) => return error_response(StatusCode::BAD_REQUEST),
    };
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(LOCATION, value);
    response
}
