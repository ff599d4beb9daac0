//! Session state, events and inspection types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a devtools session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Backend started, server not reported yet.
    Idle,
    /// Backend server is up and the proxy is listening.
    ServerConnected,
    /// A DevTools frontend is attached.
    DevtoolsConnected,
    /// Backend or proxy failed.
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::ServerConnected => write!(f, "server_connected"),
            SessionStatus::DevtoolsConnected => write!(f, "devtools_connected"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot published on every session state change.
///
/// `proxy_port` is `Some` exactly when `status` is `ServerConnected` or
/// `DevtoolsConnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub proxy_port: Option<u16>,
    pub error: Option<String>,
    pub disposed: bool,
}

impl SessionState {
    pub(crate) fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            proxy_port: None,
            error: None,
            disposed: false,
        }
    }

    pub(crate) fn connected(status: SessionStatus, proxy_port: u16) -> Self {
        Self {
            status,
            proxy_port: Some(proxy_port),
            error: None,
            disposed: false,
        }
    }

    pub(crate) fn failed(error: String) -> Self {
        Self {
            status: SessionStatus::Error,
            proxy_port: None,
            error: Some(error),
            disposed: false,
        }
    }

    /// Proxy port, if the session can be handed out.
    pub fn ready_port(&self) -> Option<u16> {
        match self.status {
            SessionStatus::ServerConnected | SessionStatus::DevtoolsConnected => self.proxy_port,
            _ => None,
        }
    }
}

/// Line/column range in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// Source location of an inspected element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub uri: String,
    pub range: SourceRange,
}

/// Result of a finished inspect-host gesture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionResult {
    pub file_location: FileLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
}

/// Typed events emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    /// `None` when inspection ended without a resolvable source location.
    Inspected(Option<InspectionResult>),
    InspectingHostChanged(bool),
}

/// Information about a session (serializable for API responses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Dev server port; the session key.
    pub target_port: u16,
    /// Port the embedded backend was asked to listen on.
    pub backend_port: u16,
    /// Port the reverse proxy listens on, when connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Error message if status is Error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Region of the host viewport, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_port_requires_connected_status() {
        assert_eq!(SessionState::idle().ready_port(), None);
        assert_eq!(SessionState::failed("boom".into()).ready_port(), None);
        assert_eq!(
            SessionState::connected(SessionStatus::DevtoolsConnected, 8001).ready_port(),
            Some(8001)
        );
    }

    #[test]
    fn inspection_result_wire_shape() {
        let value = json!({
            "fileLocation": {
                "uri": "file:///app/src/App.tsx",
                "range": {"startLine": 4, "startColumn": 2, "endLine": 4, "endColumn": 30}
            },
            "componentName": "App"
        });
        let result: InspectionResult = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(result.component_name.as_deref(), Some("App"));
        assert_eq!(result.file_location.range.end_column, 30);
        assert_eq!(serde_json::to_value(&result).unwrap(), value);
    }

    #[test]
    fn status_display_matches_serde() {
        let status = SessionStatus::DevtoolsConnected;
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            json!(status.to_string())
        );
    }
}
