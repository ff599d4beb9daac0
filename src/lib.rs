//! DevTools proxy and session manager
//!
//! This library attaches an embedded React DevTools backend to local web
//! development servers. For every dev server port it starts a session that
//! runs the backend and a reverse proxy. The proxy forwards plain HTTP and
//! WebSocket traffic to the dev server and rewrites HTML responses so the
//! page loads the DevTools client script and can be framed by the host.
//!
//! # Architecture
//!
//! - **SessionManager**: registry of sessions keyed by target port. Tracks
//!   the active session and re-broadcasts its events.
//!
//! - **Session**: state machine driven by backend callbacks. Owns at most
//!   one running proxy at a time.
//!
//! - **Proxy**: hyper server bound to the first free port from the
//!   configured range, forwarding to `localhost:{target}`.
//!
//! - **Interceptor**: decompresses HTML, injects the backend loader and the
//!   navigation bridge into `<head>`, relaxes the Content-Security-Policy.
//!
//! # Failure behaviour
//!
//! Only proxy bind exhaustion and a session reaching `Error` are reported to
//! callers. An unreachable dev server yields a 503 page, and every rewrite
//! failure passes the original response through untouched.

pub mod backend;
pub mod config;
pub mod csp;
pub mod error;
pub mod interceptor;
pub mod proxy;
pub mod session;

pub use backend::{
    BackendEvent, BackendEventSink, BackendFactory, BackendStatus, CommandSurface,
    DevtoolsBackend, ExternalProcessBackend, ProxyOnlyBackend, ScreenshotSource,
};
pub use config::{ManagerConfig, ProxyConfig};
pub use error::{BackendError, ProxyError, ScreenshotError, SessionError};
pub use interceptor::{intercept_response, InjectionOptions, Outcome};
pub use proxy::{start_proxy, ProxyHandle};
pub use session::{
    ActiveSessionEvent, InspectionResult, Session, SessionEvent, SessionInfo, SessionManager,
    SessionStatus,
};
