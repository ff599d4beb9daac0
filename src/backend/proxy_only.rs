//! Backend that only reports its server as connected.
//!
//! Used when no real DevTools backend is configured: the proxy and the
//! script injection still run, the injected loader simply finds nothing.

use super::{BackendEvent, BackendEventSink, BackendStatus, DevtoolsBackend};
use crate::error::BackendError;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct ProxyOnlyBackend {
    port: Mutex<Option<u16>>,
}

impl ProxyOnlyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DevtoolsBackend for ProxyOnlyBackend {
    fn start_server(
        &self,
        suggested_port: u16,
        _host: &str,
        events: BackendEventSink,
    ) -> Result<(), BackendError> {
        *self.port.lock().unwrap_or_else(|e| e.into_inner()) = Some(suggested_port);
        events
            .send(BackendEvent::status(
                BackendStatus::ServerConnected,
                "Proxy-only backend ready",
            ))
            .map_err(|_| BackendError::StartFailed("session is gone".to_string()))
    }

    fn stop_server(&self) {
        self.port.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn current_port(&self) -> Option<u16> {
        *self.port.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_inspecting_host(&self) {
        debug!("Host inspection is not available without a devtools backend");
    }

    fn stop_inspecting_host(&self) {}
}
