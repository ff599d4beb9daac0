//! Request forwarding: plain HTTP, HTML interception and WebSocket tunnels.

use crate::interceptor::{intercept_response, is_html, InjectionOptions};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST, UPGRADE};
use hyper::http::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower_service::Service;
use tracing::{debug, warn};

/// Body type of every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Failures while talking to the upstream dev server.
#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read body: {0}")]
    Body(#[from] hyper::Error),
    #[error("invalid upstream request: {0}")]
    Request(#[from] hyper::http::Error),
}

impl ForwardError {
    /// Refused connections, failed lookups and resets mean the dev server is
    /// not (yet) reachable.
    fn is_unreachable(&self) -> bool {
        if let ForwardError::Client(e) = self {
            if e.is_connect() {
                return true;
            }
        }
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if matches!(
                    io.kind(),
                    ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::NotFound
                ) {
                    return true;
                }
            }
            if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
                if hyper_err.is_incomplete_message() {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

struct Forwarder {
    target_port: u16,
    injection: InjectionOptions,
    client: UpstreamClient,
    shutdown: CancellationToken,
}

/// Tower service forwarding every request to one target port.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Forwarder>,
}

impl ProxyService {
    pub fn new(target_port: u16, injection: InjectionOptions, shutdown: CancellationToken) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            inner: Arc::new(Forwarder {
                target_port,
                injection,
                client,
                shutdown,
            }),
        }
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.handle(req).await) })
    }
}

impl Forwarder {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let result = if is_websocket_upgrade(&req) {
            self.forward_upgrade(req).await
        } else {
            self.forward_http(req).await
        };
        match result {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    target_port = self.target_port,
                    method = %method,
                    path = %path,
                    error = %e,
                    "Proxy request failed"
                );
                self.error_response(&e)
            }
        }
    }

    fn upstream_uri(&self, uri: &Uri) -> Result<Uri, hyper::http::Error> {
        let path = uri.path_and_query().map(|x| x.as_str()).unwrap_or("/");
        Ok(format!("http://localhost:{}{}", self.target_port, path).parse::<Uri>()?)
    }

    fn host_header(&self) -> HeaderValue {
        HeaderValue::from_str(&format!("localhost:{}", self.target_port))
            .unwrap_or_else(|_| HeaderValue::from_static("localhost"))
    }

    async fn forward_http(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ForwardError> {
        let (mut parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.headers.insert(HOST, self.host_header());

        let upstream = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await?;
        let (mut parts, body) = upstream.into_parts();
        if !is_html(&parts.headers) {
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let raw = body.collect().await?.to_bytes();
        let intercepted = intercept_response(&parts.headers, raw, &self.injection);
        debug!(
            target_port = self.target_port,
            outcome = ?intercepted.outcome,
            "Intercepted HTML response"
        );
        parts.headers = intercepted.headers;
        Ok(Response::from_parts(parts, full_body(intercepted.body)))
    }

    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let mut upstream_req = Request::builder()
            .method(req.method())
            .uri(self.upstream_uri(req.uri())?)
            .body(Full::new(Bytes::new()))?;
        *upstream_req.headers_mut() = req.headers().clone();
        upstream_req.headers_mut().insert(HOST, self.host_header());

        let mut upstream = self.client.request(upstream_req).await?;
        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(
                target_port = self.target_port,
                status = %upstream.status(),
                "Upstream declined WebSocket upgrade"
            );
            let (parts, body) = upstream.into_parts();
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let mut resp = Response::new(empty_body());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *resp.headers_mut() = upstream.headers().clone();

        let target_port = self.target_port;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let upgraded = tokio::try_join!(
                hyper::upgrade::on(&mut req),
                hyper::upgrade::on(&mut upstream)
            );
            let (client, server) = match upgraded {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(target_port = target_port, error = %e, "WebSocket upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut server = TokioIo::new(server);
            tokio::select! {
                res = tokio::io::copy_bidirectional(&mut client, &mut server) => {
                    if let Err(e) = res {
                        debug!(target_port = target_port, error = %e, "WebSocket tunnel closed with error");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!(target_port = target_port, "Closing WebSocket tunnel");
                }
            }
        });

        Ok(resp)
    }

    fn error_response(&self, err: &ForwardError) -> Response<ProxyBody> {
        let (status, message) = if err.is_unreachable() {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "Could not connect to the development server on port {}. Make sure it is running.",
                    self.target_port
                ),
            )
        } else {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy error: {err}"),
            )
        };
        Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full_body(message))
            .expect("valid response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(target_port: u16) -> Forwarder {
        Forwarder {
            target_port,
            injection: InjectionOptions {
                backend_host: "localhost".to_string(),
                backend_port: 8097,
            },
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let f = forwarder(3000);
        let uri: Uri = "/assets/app.js?v=3".parse().unwrap();
        assert_eq!(
            f.upstream_uri(&uri).unwrap(),
            "http://localhost:3000/assets/app.js?v=3"
        );
        assert_eq!(f.host_header(), "localhost:3000");
    }

    #[test]
    fn websocket_upgrade_detection() {
        let req = Request::builder()
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));
        let req = Request::builder().header(UPGRADE, "h2c").body(()).unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let f = forwarder(port);
        let req = Request::builder()
            .uri(format!("http://127.0.0.1:{port}/"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = ForwardError::from(f.client.request(req).await.unwrap_err());
        assert!(err.is_unreachable());

        let resp = f.error_response(&err);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains(&format!("port {port}")));
    }

    #[test]
    fn malformed_request_is_internal_error() {
        let err = ForwardError::Request(Request::builder().uri("http://[::1").body(()).unwrap_err());
        assert!(!err.is_unreachable());
        assert_eq!(
            forwarder(3000).error_response(&err).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
