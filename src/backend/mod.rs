//! Interfaces to the collaborators a session depends on.
//!
//! The embedded DevTools backend, the host screenshot capability and the
//! command surface all live outside this crate. Sessions only talk to them
//! through the traits below. Backend callbacks are delivered as a closed set
//! of [`BackendEvent`]s over a channel handed to the backend once, when its
//! server is started.

mod process;
mod proxy_only;

pub use process::ExternalProcessBackend;
pub use proxy_only::ProxyOnlyBackend;

use crate::error::BackendError;
use crate::session::InspectionResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Status values reported by the backend's status listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    ServerConnected,
    DevtoolsConnected,
    Error,
}

/// One backend callback invocation.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Status listener: human-readable message plus status.
    Status {
        message: String,
        status: BackendStatus,
    },
    /// Inspection finished. `None` when no source location could be resolved.
    Inspection(Option<InspectionResult>),
    /// The DevTools frontend disconnected.
    Disconnected,
    /// Host inspection mode toggled.
    InspectingHost(bool),
}

impl BackendEvent {
    pub fn status(status: BackendStatus, message: impl Into<String>) -> Self {
        BackendEvent::Status {
            message: message.into(),
            status,
        }
    }
}

/// Sending half handed to a backend when its server starts.
pub type BackendEventSink = mpsc::UnboundedSender<BackendEvent>;

/// An embedded DevTools backend instance. One instance per session.
pub trait DevtoolsBackend: Send + Sync {
    /// Start the backend server near `suggested_port`. Status changes are
    /// reported through `events`, never by return value.
    fn start_server(
        &self,
        suggested_port: u16,
        host: &str,
        events: BackendEventSink,
    ) -> Result<(), BackendError>;

    fn stop_server(&self);

    /// Port the backend server is listening on, if running.
    fn current_port(&self) -> Option<u16>;

    fn start_inspecting_host(&self);

    fn stop_inspecting_host(&self);
}

/// Creates a fresh backend for every new session.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Box<dyn DevtoolsBackend>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Box<dyn DevtoolsBackend> + Send + Sync,
{
    fn create(&self) -> Box<dyn DevtoolsBackend> {
        self()
    }
}

/// Full-viewport capture of the host application window.
pub trait ScreenshotSource: Send + Sync {
    /// Encoded image bytes, or `None` when nothing could be captured.
    fn capture(&self) -> Pin<Box<dyn Future<Output = Option<Vec<u8>>> + Send + '_>>;
}

/// Metadata passed along with a "show browser" command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserMetadata {
    /// Backend port to target port, for every known session.
    pub sessions: BTreeMap<u16, u16>,
}

/// Options of the "show browser at URL" command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowBrowserOptions {
    pub metadata: BrowserMetadata,
    pub in_preview: bool,
}

/// Host editor command surface.
pub trait CommandSurface: Send + Sync {
    fn show_browser(&self, url: &str, options: &ShowBrowserOptions) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn show_browser_options_wire_shape() {
        let options = ShowBrowserOptions {
            metadata: BrowserMetadata {
                sessions: BTreeMap::from([(8097, 3000), (8098, 3001)]),
            },
            in_preview: true,
        };
        assert_eq!(
            serde_json::to_value(&options).unwrap(),
            json!({
                "metadata": {"sessions": {"8097": 3000, "8098": 3001}},
                "inPreview": true
            })
        );
    }
}
