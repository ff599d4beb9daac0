//! Test doubles shared by the session and manager tests.

use super::devtools::Session;
use super::types::SessionState;
use crate::backend::{
    BackendEvent, BackendEventSink, BackendStatus, CommandSurface, DevtoolsBackend,
    ScreenshotSource, ShowBrowserOptions,
};
use crate::error::BackendError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct Recorded {
    sink: Option<BackendEventSink>,
    port: Option<u16>,
    started_ports: Vec<u16>,
    stops: usize,
    inspecting: Option<bool>,
    observed: Option<watch::Receiver<SessionState>>,
    ready_at_lookup: Vec<Option<u16>>,
}

/// Backend driven by the test through its [`BackendControl`].
pub(crate) struct ScriptedBackend {
    auto_connect: bool,
    fail_start: bool,
    recorded: Arc<Mutex<Recorded>>,
}

/// Test-side handle of a [`ScriptedBackend`].
#[derive(Clone)]
pub(crate) struct BackendControl {
    recorded: Arc<Mutex<Recorded>>,
}

fn lock(recorded: &Mutex<Recorded>) -> MutexGuard<'_, Recorded> {
    recorded.lock().unwrap()
}

impl ScriptedBackend {
    fn build(auto_connect: bool, fail_start: bool) -> (Self, BackendControl) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let control = BackendControl {
            recorded: recorded.clone(),
        };
        (
            Self {
                auto_connect,
                fail_start,
                recorded,
            },
            control,
        )
    }

    /// Reports nothing on its own.
    pub(crate) fn new() -> (Self, BackendControl) {
        Self::build(false, false)
    }

    /// Reports `ServerConnected` as soon as it is started.
    pub(crate) fn auto_connect() -> (Self, BackendControl) {
        Self::build(true, false)
    }

    /// Refuses to start.
    pub(crate) fn failing() -> (Self, BackendControl) {
        Self::build(false, true)
    }
}

impl DevtoolsBackend for ScriptedBackend {
    fn start_server(
        &self,
        suggested_port: u16,
        _host: &str,
        events: BackendEventSink,
    ) -> Result<(), BackendError> {
        if self.fail_start {
            return Err(BackendError::StartFailed("scripted failure".to_string()));
        }
        let mut recorded = lock(&self.recorded);
        recorded.started_ports.push(suggested_port);
        recorded.port = Some(suggested_port);
        if self.auto_connect {
            let _ = events.send(BackendEvent::status(BackendStatus::ServerConnected, "up"));
        }
        recorded.sink = Some(events);
        Ok(())
    }

    fn stop_server(&self) {
        let mut recorded = lock(&self.recorded);
        recorded.stops += 1;
        recorded.port = None;
    }

    fn current_port(&self) -> Option<u16> {
        let mut recorded = lock(&self.recorded);
        let ready = recorded.observed.as_ref().map(|rx| rx.borrow().ready_port());
        if let Some(ready) = ready {
            recorded.ready_at_lookup.push(ready);
        }
        recorded.port
    }

    fn start_inspecting_host(&self) {
        lock(&self.recorded).inspecting = Some(true);
    }

    fn stop_inspecting_host(&self) {
        lock(&self.recorded).inspecting = Some(false);
    }
}

impl BackendControl {
    /// Deliver a backend callback. Panics if the server was never started.
    pub(crate) fn emit(&self, event: BackendEvent) {
        let recorded = lock(&self.recorded);
        let sink = recorded.sink.as_ref().expect("backend server not started");
        sink.send(event).expect("session task gone");
    }

    pub(crate) fn started_ports(&self) -> Vec<u16> {
        lock(&self.recorded).started_ports.clone()
    }

    pub(crate) fn start_count(&self) -> usize {
        lock(&self.recorded).started_ports.len()
    }

    pub(crate) fn stop_count(&self) -> usize {
        lock(&self.recorded).stops
    }

    pub(crate) fn inspecting(&self) -> Option<bool> {
        lock(&self.recorded).inspecting
    }

    /// From now on, record the ready port of `state` on every backend port lookup.
    pub(crate) fn observe_state(&self, state: watch::Receiver<SessionState>) {
        lock(&self.recorded).observed = Some(state);
    }

    pub(crate) fn ready_at_lookup(&self) -> Vec<Option<u16>> {
        lock(&self.recorded).ready_at_lookup.clone()
    }
}

/// Screenshot source returning the same capture every time.
pub(crate) struct FixedScreenshot(pub Option<Vec<u8>>);

impl ScreenshotSource for FixedScreenshot {
    fn capture(&self) -> Pin<Box<dyn Future<Output = Option<Vec<u8>>> + Send + '_>> {
        let capture = self.0.clone();
        Box::pin(async move { capture })
    }
}

/// Command surface recording every call.
#[derive(Default)]
pub(crate) struct RecordingSurface {
    calls: Mutex<Vec<(String, ShowBrowserOptions)>>,
}

impl RecordingSurface {
    pub(crate) fn calls(&self) -> Vec<(String, ShowBrowserOptions)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandSurface for RecordingSurface {
    fn show_browser(&self, url: &str, options: &ShowBrowserOptions) -> Result<(), String> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), options.clone()));
        Ok(())
    }
}

/// A port that was free a moment ago.
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait (bounded) until the session state satisfies `pred`.
pub(crate) async fn wait_for_state(
    session: &Session,
    pred: impl Fn(&SessionState) -> bool,
) -> SessionState {
    let mut rx = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = rx.borrow_and_update().clone();
            if pred(&state) {
                return state;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("session state not reached in time")
}
