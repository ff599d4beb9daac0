//! Error types for the devtools proxy.
//!
//! Only proxy bind exhaustion and a session reaching `Error` are surfaced to
//! callers. Upstream, decompression and rewriting failures are recovered
//! locally (503 responses or fail-open pass-through) and never show up here.

use thiserror::Error;

/// Fixed message surfaced to `start_or_get_session` callers when a session fails.
pub const SESSION_FAILED_MESSAGE: &str = "Devtools session failed to start";

/// Errors raised while starting or running a reverse proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No free proxy port in {first}..={last} after {attempts} attempts: {source}")]
    PortsExhausted {
        first: u16,
        last: u16,
        attempts: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind proxy listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy is configured with zero bind attempts")]
    NoAttempts,
}

/// Errors reported by an embedded DevTools backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to start devtools backend: {0}")]
    StartFailed(String),

    #[error("Devtools backend is not running")]
    NotRunning,
}

/// Errors raised while acquiring a cropped screenshot.
#[derive(Error, Debug)]
pub enum ScreenshotError {
    #[error("Session for target port {0} is idle")]
    SessionIdle(u16),

    #[error("Failed to decode screenshot: {0}")]
    Decode(#[from] image::ImageError),
}

/// Errors for session and session manager operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{SESSION_FAILED_MESSAGE}")]
    SessionFailed,

    #[error("No session for target port {0}")]
    SessionNotFound(u16),

    #[error("Session for target port {0} has been disposed")]
    Disposed(u16),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Command surface failed: {0}")]
    Command(String),
}

impl From<tokio::sync::watch::error::RecvError> for SessionError {
    fn from(_: tokio::sync::watch::error::RecvError) -> Self {
        SessionError::SessionFailed
    }
}
