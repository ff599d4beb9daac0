//! Devtools sessions and the manager that owns them.
//!
//! A session ties one dev server (the target port) to one embedded DevTools
//! backend and, once that backend's server is up, to one reverse proxy that
//! injects the backend loader into every HTML page. The manager keeps one
//! session per target port and forwards the events of the active session.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    SessionManager                         │
//! │  sessions: HashMap<target_port, Arc<Session>>             │
//! │  active:   target_port + event forwarder task             │
//! │  events:   broadcast<ActiveSessionEvent>  ──▶ host UI     │
//! └──────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────────┐           ┌──────────────────────┐
//! │ Session :3000        │           │ Session :3001        │
//! │ backend :8097        │           │ backend :8098        │
//! │ proxy   :8000 ──▶ 3000│           │ proxy   :8001 ──▶ 3001│
//! └──────────────────────┘           └──────────────────────┘
//! ```
//!
//! Session status flows `Idle → ServerConnected ⇄ DevtoolsConnected`, with
//! `Error` reachable from any state and left again through a retry.

mod devtools;
mod manager;
mod ports;
mod screenshot;
#[cfg(test)]
pub(crate) mod testing;
mod types;

pub use devtools::{Session, SessionOptions};
pub use manager::{ActiveSessionEvent, SessionManager, SessionStats};
pub use ports::{backend_port_map, suggest_backend_port};
pub use screenshot::crop_screenshot;
pub use types::{
    FileLocation, InspectionResult, ScreenshotRect, SessionEvent, SessionInfo, SessionState,
    SessionStatus, SourceRange,
};
