//! Listener setup, bind retry and connection serving.

use super::forward::ProxyService;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::interceptor::InjectionOptions;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A running proxy. Dropping the handle shuts the proxy down.
pub struct ProxyHandle {
    port: u16,
    target_port: u16,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Port the proxy listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port of the dev server the proxy forwards to.
    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Whether `cleanup` has run.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting connections and close in-flight ones gracefully.
    /// Never fails and may be called any number of times.
    pub fn cleanup(&self) {
        if self.token.is_cancelled() {
            return;
        }
        info!(
            proxy_port = self.port,
            target_port = self.target_port,
            "Closing proxy"
        );
        self.token.cancel();
    }

    /// Like [`cleanup`](Self::cleanup), then wait until the listener is closed.
    pub async fn shutdown(mut self) {
        self.cleanup();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(proxy_port = self.port, error = %e, "Proxy task ended abnormally");
            }
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Start a proxy for `target_port` on the first free port from `config`.
pub async fn start_proxy(
    target_port: u16,
    injection: InjectionOptions,
    config: &ProxyConfig,
) -> Result<ProxyHandle, ProxyError> {
    let (listener, port) = bind_with_retry(config).await?;
    let token = CancellationToken::new();
    let service = ProxyService::new(target_port, injection, token.clone());
    let task = tokio::spawn(serve(listener, service, token.clone()));

    info!(
        proxy_port = port,
        target_port = target_port,
        "Proxy listening on http://{}:{}",
        config.host,
        port
    );
    Ok(ProxyHandle {
        port,
        target_port,
        token,
        task: Some(task),
    })
}

/// Bind the first candidate port that is not in use.
///
/// Only `AddrInUse` moves on to the next port; any other bind error is
/// returned immediately. A failed attempt leaves nothing open.
pub async fn bind_with_retry(config: &ProxyConfig) -> Result<(TcpListener, u16), ProxyError> {
    let mut last_error = None;
    let mut attempts = 0u16;
    for port in config.candidate_ports() {
        attempts += 1;
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port = port, "Proxy port in use, trying next");
                last_error = Some(e);
            }
            Err(e) => return Err(ProxyError::Bind { port, source: e }),
        }
    }

    match last_error {
        Some(source) => Err(ProxyError::PortsExhausted {
            first: config.base_port,
            last: config.base_port.saturating_add(attempts.saturating_sub(1)),
            attempts,
            source,
        }),
        None => Err(ProxyError::NoAttempts),
    }
}

async fn serve(listener: TcpListener, service: ProxyService, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => {
                let stream = match res {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept proxy connection");
                        continue;
                    }
                };
                let svc = service.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let conn = http1::Builder::new()
                        .serve_connection(io, TowerToHyperService::new(svc))
                        .with_upgrades();
                    tokio::pin!(conn);
                    let result = tokio::select! {
                        res = conn.as_mut() => res,
                        _ = token.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            conn.as_mut().await
                        }
                    };
                    if let Err(err) = result {
                        debug!("proxy connection error: {err}");
                    }
                });
            }
        }
    }
    drop(listener);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_port: u16, max_attempts: u16) -> ProxyConfig {
        ProxyConfig {
            host: "127.0.0.1".to_string(),
            base_port,
            max_attempts,
        }
    }

    async fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn skips_port_in_use() {
        let (_blocker, port) = occupied_port().await;
        let (listener, bound) = bind_with_retry(&config(port, 10)).await.unwrap();
        assert!(bound > port && bound < port + 10);
        assert_eq!(listener.local_addr().unwrap().port(), bound);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail() {
        let (_blocker, port) = occupied_port().await;
        let err = bind_with_retry(&config(port, 1)).await.unwrap_err();
        match err {
            ProxyError::PortsExhausted {
                first,
                last,
                attempts,
                source,
            } => {
                assert_eq!((first, last, attempts), (port, port, 1));
                assert_eq!(source.kind(), ErrorKind::AddrInUse);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_attempts_is_an_error() {
        let err = bind_with_retry(&config(8000, 0)).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAttempts));
    }

    #[tokio::test]
    async fn shutdown_releases_the_port() {
        let (blocker, port) = occupied_port().await;
        drop(blocker);
        let injection = InjectionOptions {
            backend_host: "localhost".to_string(),
            backend_port: 8097,
        };
        let handle = start_proxy(3000, injection, &config(port, 1)).await.unwrap();
        assert_eq!(handle.port(), port);
        handle.cleanup();
        handle.cleanup();
        handle.shutdown().await;
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }
}
