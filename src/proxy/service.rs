//! The TLS-terminating forward proxy.
//!
//! The proxy serves a listener whose socket was bound *inside* the sandbox
//! net namespace while the accept loop and all upstream traffic run outside
//! it. The browser therefore reaches the proxy on sandbox loopback, and the
//! proxy reaches the world with the host's DNS and routing.
//!
//! Per decrypted request: vendor-internal traffic is suppressed with an
//! empty 504 (see [`classify`]); CONNECT requests are dialed upstream,
//! answered with 200, upgraded, and bridged byte-for-byte; everything else
//! is re-issued as a plain outbound request and its response streamed back
//! with `Connection: close` forced and `Content-Length` stripped.
//!
//! Per-request failures map to HTTP statuses (400/502/504) and are logged;
//! they never tear down the proxy.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::ProxyError;
use crate::proxy::classify;

/// Body type produced by the proxy handler.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Default deadline for upstream CONNECT dials.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// The request handler shared by all proxy connections.
#[derive(Debug, Clone)]
pub struct Proxy {
    client: reqwest::Client,
    dial_timeout: Duration,
    allow_internal_requests: bool,
}

impl Proxy {
    /// Builds a proxy handler with its own upstream HTTP client.
    ///
    /// The client never follows redirects; the browser sees them verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UpstreamClient`] if the client cannot be built.
    pub fn new(allow_internal_requests: bool) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            allow_internal_requests,
        })
    }

    /// Sets the upstream dial deadline for CONNECT tunnels.
    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Handles one decrypted request.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        if !self.allow_internal_requests && classify::is_internal_request(&method, &uri) {
            trace!(%method, %uri, "Suppressing internal browser request");
            return status_response(StatusCode::GATEWAY_TIMEOUT, "");
        }

        info!("proxy: {method} {uri}");

        if method == Method::CONNECT {
            self.connect(req).await
        } else {
            self.passthrough(req).await
        }
    }

    /// CONNECT: dial upstream, answer 200, upgrade, bridge.
    async fn connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };
        let addr = authority.to_string();
        debug!(%addr, "CONNECT dial");

        let upstream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "CONNECT dial failed");
                return status_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
            Err(_) => {
                warn!(%addr, "CONNECT dial timed out");
                return status_response(StatusCode::GATEWAY_TIMEOUT, "upstream dial timed out");
            }
        };

        tokio::spawn(async move {
            // The upgrade hands over the connection together with any bytes
            // the client already sent past the CONNECT header.
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => match bridge(TokioIo::new(upgraded), upstream).await {
                    Ok((tx, rx)) => trace!(%addr, tx, rx, "Tunnel closed"),
                    Err(e) => debug!(%addr, error = %e, "Tunnel closed with error"),
                },
                Err(e) => warn!(%addr, error = %e, "CONNECT upgrade failed"),
            }
        });

        Response::new(empty_body())
    }

    /// Proxy-form request: rebuild it as an ordinary outbound request and
    /// stream the answer back.
    async fn passthrough(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let Some(url) = outbound_url(&parts.uri, &parts.headers) else {
            return status_response(StatusCode::BAD_REQUEST, "request has no destination host");
        };

        let outbound_body = reqwest::Body::wrap_stream(
            BodyStream::new(body)
                .try_filter_map(|frame| std::future::ready(Ok(frame.into_data().ok()))),
        );

        let upstream = match self
            .client
            .request(parts.method.clone(), &url)
            .headers(clone_headers(&parts.headers))
            .body(outbound_body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "Upstream round trip failed");
                return status_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        let mut response = Response::new(empty_body());
        *response.status_mut() = upstream.status();

        let headers = response.headers_mut();
        for (name, value) in upstream.headers() {
            headers.append(name.clone(), value.clone());
        }
        // The body is re-streamed without a known length, one connection per
        // request.
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.remove(CONTENT_LENGTH);

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(std::io::Error::other);
        *response.body_mut() = StreamBody::new(stream).boxed_unsync();

        response
    }
}

/// Accept loop: wrap each connection in TLS, serve HTTP/1.1 with upgrades.
///
/// The listener is typically bound inside the sandbox net namespace by the
/// supervisor; it must outlive the browser.
///
/// # Errors
///
/// Returns [`ProxyError::Listener`] if accepting fails; per-connection
/// errors are logged and swallowed.
pub async fn serve(
    listener: TcpListener,
    tls: TlsAcceptor,
    proxy: Proxy,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "TLS proxy serving");
    }

    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => {
                debug!("Proxy accept loop cancelled");
                return Ok(());
            }
            accepted = listener.accept() => accepted.map_err(ProxyError::Listener)?,
        };

        let tls = tls.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let tls_stream = match tls.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.handle(req).await) }
            });

            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .with_upgrades();

            if let Err(e) = conn.await {
                debug!(%peer, error = %e, "Proxy connection closed with error");
            }
        });
    }
}

/// Copies bytes in both directions until either side closes; the write half
/// opposite a finished read half is shut down, which propagates the close.
/// Also used by the remote-debug relay.
pub(crate) async fn bridge<A, B>(mut a: A, mut b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(&mut a, &mut b).await
}

/// Rebuilds the destination URL for a passthrough request.
///
/// Proxy-form requests carry an absolute URI; origin-form fallbacks take the
/// scheme as `http` and the host from the `Host` header.
fn outbound_url(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(String::from)
        })?;
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Some(format!("{scheme}://{host}{path_and_query}"))
}

/// Headers are forwarded as received; the upstream client fills in its own
/// `Host` from the URL.
fn clone_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        out.append(name.clone(), value.clone());
    }
    out
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_owned()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_url_from_absolute_uri() {
        let uri = Uri::from_static("http://example.com/path?q=1");
        let url = outbound_url(&uri, &HeaderMap::new());
        assert_eq!(url.as_deref(), Some("http://example.com/path?q=1"));
    }

    #[test]
    fn test_outbound_url_falls_back_to_host_header() {
        let uri = Uri::from_static("/just/a/path");
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("fallback.test:8080"));

        let url = outbound_url(&uri, &headers);
        assert_eq!(url.as_deref(), Some("http://fallback.test:8080/just/a/path"));
    }

    #[test]
    fn test_outbound_url_without_any_host_is_rejected() {
        let uri = Uri::from_static("/nohost");
        assert_eq!(outbound_url(&uri, &HeaderMap::new()), None);
    }

    #[test]
    fn test_status_response_closes_the_connection() {
        let response = status_response(StatusCode::GATEWAY_TIMEOUT, "");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get(CONNECTION),
            Some(&HeaderValue::from_static("close"))
        );
    }

    #[test]
    fn test_clone_headers_preserves_repeated_names() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let cloned = clone_headers(&headers);
        let values: Vec<_> = cloned.get_all("set-cookie").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
