//! One devtools session: backend, proxy and status state machine.

use super::screenshot::crop_screenshot;
use super::types::{
    InspectionResult, ScreenshotRect, SessionEvent, SessionInfo, SessionState, SessionStatus,
};
use crate::backend::{
    BackendEvent, BackendEventSink, BackendStatus, DevtoolsBackend, ScreenshotSource,
};
use crate::config::ProxyConfig;
use crate::error::{ScreenshotError, SessionError};
use crate::interceptor::InjectionOptions;
use crate::proxy::{start_proxy, ProxyHandle};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the per-session event channel.
const EVENT_CAPACITY: usize = 64;

/// Everything a session needs besides its backend.
#[derive(Clone)]
pub struct SessionOptions {
    pub target_port: u16,
    pub backend_port: u16,
    pub backend_host: String,
    pub proxy: ProxyConfig,
    pub screenshots: Option<Arc<dyn ScreenshotSource>>,
}

enum SessionCommand {
    Retry,
}

/// A devtools session bound to one target port.
///
/// All state transitions happen on the session's own task, which consumes
/// backend events and commands in order. That task is the only caller of
/// [`start_proxy`] for the session, so at most one proxy is bound at a time.
pub struct Session {
    target_port: u16,
    backend_port: u16,
    backend_host: String,
    proxy_config: ProxyConfig,
    created_at: DateTime<Utc>,
    backend: Box<dyn DevtoolsBackend>,
    backend_events: BackendEventSink,
    backend_up: AtomicBool,
    screenshots: Option<Arc<dyn ScreenshotSource>>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    proxy: Mutex<Option<ProxyHandle>>,
    last_inspected: Mutex<Option<InspectionResult>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    disposed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    /// Create the session and start its backend server.
    ///
    /// Must be called from within a tokio runtime. The session stays alive
    /// until [`dispose`](Self::dispose) is called.
    pub fn start(
        options: SessionOptions,
        backend: Box<dyn DevtoolsBackend>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Session::new(options, backend);
        session.start_backend()?;
        Ok(session)
    }

    /// Create the session and its event task without starting the backend.
    ///
    /// Lets callers subscribe before the backend can report anything; follow
    /// up with [`start_backend`](Self::start_backend).
    pub fn new(options: SessionOptions, backend: Box<dyn DevtoolsBackend>) -> Arc<Session> {
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::idle());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = Arc::new(Session {
            target_port: options.target_port,
            backend_port: options.backend_port,
            backend_host: options.backend_host,
            proxy_config: options.proxy,
            created_at: Utc::now(),
            backend,
            backend_events: backend_tx,
            backend_up: AtomicBool::new(false),
            screenshots: options.screenshots,
            state,
            events,
            proxy: Mutex::new(None),
            last_inspected: Mutex::new(None),
            commands: commands_tx,
            disposed: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run(session.clone(), backend_rx, commands_rx));
        *lock(&session.task) = Some(task);
        session
    }

    /// Start the backend server. On failure the session is disposed.
    pub fn start_backend(&self) -> Result<(), SessionError> {
        info!(
            target_port = self.target_port,
            backend_port = self.backend_port,
            "Starting devtools session"
        );
        if let Err(e) = self.backend.start_server(
            self.backend_port,
            &self.backend_host,
            self.backend_events.clone(),
        ) {
            error!(target_port = self.target_port, error = %e, "Devtools backend failed to start");
            self.dispose();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Port the backend was asked to listen on.
    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }

    /// Port the backend actually listens on, falling back to the suggested one.
    pub fn current_backend_port(&self) -> u16 {
        self.backend.current_port().unwrap_or(self.backend_port)
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    pub fn proxy_port(&self) -> Option<u16> {
        self.state.borrow().proxy_port
    }

    /// Watch state snapshots. The current value is marked unseen.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribe to typed session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn last_inspected(&self) -> Option<InspectionResult> {
        lock(&self.last_inspected).clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            target_port: self.target_port,
            backend_port: self.current_backend_port(),
            proxy_port: state.proxy_port,
            status: state.status,
            created_at: self.created_at,
            error: state.error,
        }
    }

    /// Ask a failed session to recover. A no-op unless the status is `Error`.
    pub fn retry(&self) {
        let _ = self.commands.send(SessionCommand::Retry);
    }

    pub fn start_inspecting_host(&self) {
        self.backend.start_inspecting_host();
        // The backend does not reliably report the start of inspection.
        self.emit(SessionEvent::InspectingHostChanged(true));
    }

    pub fn stop_inspecting_host(&self) {
        self.backend.stop_inspecting_host();
    }

    /// Capture the host viewport and crop it to `rect`.
    ///
    /// Fails fast while the session is idle. `Ok(None)` means no screenshot
    /// was available.
    pub async fn get_screenshot(
        &self,
        rect: ScreenshotRect,
        device_pixel_ratio: f64,
    ) -> Result<Option<Vec<u8>>, ScreenshotError> {
        if self.status() == SessionStatus::Idle {
            return Err(ScreenshotError::SessionIdle(self.target_port));
        }
        let Some(source) = self.screenshots.as_ref() else {
            return Ok(None);
        };
        let Some(capture) = source.capture().await else {
            debug!(target_port = self.target_port, "No screenshot available");
            return Ok(None);
        };
        crop_screenshot(&capture, rect, device_pixel_ratio)
    }

    /// Release the proxy, then stop the backend server. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target_port = self.target_port, "Disposing devtools session");
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.release_proxy();
        self.backend.stop_server();
        self.backend_up.store(false, Ordering::SeqCst);
        self.state.send_replace(SessionState {
            disposed: true,
            ..SessionState::idle()
        });
        self.emit(SessionEvent::StatusChanged(SessionStatus::Idle));
    }

    /// Stop the running proxy, if any. Returns whether one was running.
    fn release_proxy(&self) -> bool {
        match lock(&self.proxy).take() {
            Some(proxy) => {
                proxy.cleanup();
                true
            }
            None => false,
        }
    }

    /// Drop the proxy port from the published state without a status change.
    fn withdraw_proxy_port(&self) {
        if self.is_disposed() {
            return;
        }
        self.state.send_modify(|state| state.proxy_port = None);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, state: SessionState) {
        if self.is_disposed() {
            return;
        }
        let status = state.status;
        let previous = self.state.send_replace(state);
        if previous.status != status {
            info!(
                target_port = self.target_port,
                from = %previous.status,
                to = %status,
                "Session status changed"
            );
        }
        self.emit(SessionEvent::StatusChanged(status));
    }

    /// Replace any running proxy with a fresh one and enter `ServerConnected`.
    async fn connect_proxy(&self) {
        // Waiters must never be handed the port of a proxy that is gone.
        if self.release_proxy() {
            self.withdraw_proxy_port();
        }
        let injection = InjectionOptions {
            backend_host: self.backend_host.clone(),
            backend_port: self.current_backend_port(),
        };
        match start_proxy(self.target_port, injection, &self.proxy_config).await {
            Ok(handle) => {
                if self.is_disposed() {
                    handle.cleanup();
                    return;
                }
                let port = handle.port();
                *lock(&self.proxy) = Some(handle);
                self.publish(SessionState::connected(SessionStatus::ServerConnected, port));
            }
            Err(e) => {
                error!(target_port = self.target_port, error = %e, "Failed to start proxy");
                self.publish(SessionState::failed(e.to_string()));
            }
        }
    }

    async fn on_backend_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Status { message, status } => {
                debug!(target_port = self.target_port, status = ?status, message = %message, "Backend status");
                self.on_backend_status(status, message).await;
            }
            BackendEvent::Disconnected => {
                if self.status() == SessionStatus::DevtoolsConnected {
                    info!(target_port = self.target_port, "Devtools disconnected, restarting proxy");
                    self.connect_proxy().await;
                } else {
                    debug!(target_port = self.target_port, "Ignoring disconnect while {}", self.status());
                }
            }
            BackendEvent::Inspection(result) => {
                if let Some(result) = &result {
                    *lock(&self.last_inspected) = Some(result.clone());
                }
                self.emit(SessionEvent::Inspected(result));
            }
            BackendEvent::InspectingHost(inspecting) => {
                self.emit(SessionEvent::InspectingHostChanged(inspecting));
            }
        }
    }

    async fn on_backend_status(&self, status: BackendStatus, message: String) {
        match (status, self.status()) {
            (BackendStatus::ServerConnected, SessionStatus::Idle | SessionStatus::Error) => {
                self.backend_up.store(true, Ordering::SeqCst);
                self.connect_proxy().await;
            }
            (BackendStatus::ServerConnected, SessionStatus::DevtoolsConnected) => {
                info!(target_port = self.target_port, "Devtools frontend gone, restarting proxy");
                self.connect_proxy().await;
            }
            (BackendStatus::ServerConnected, SessionStatus::ServerConnected) => {}
            (BackendStatus::DevtoolsConnected, SessionStatus::ServerConnected) => {
                if let Some(port) = self.proxy_port() {
                    self.publish(SessionState::connected(SessionStatus::DevtoolsConnected, port));
                }
            }
            (BackendStatus::DevtoolsConnected, SessionStatus::DevtoolsConnected) => {}
            (BackendStatus::DevtoolsConnected, current) => {
                warn!(
                    target_port = self.target_port,
                    "Ignoring devtools connection while {current}"
                );
            }
            (BackendStatus::Error, _) => {
                self.backend_up.store(false, Ordering::SeqCst);
                self.release_proxy();
                self.publish(SessionState::failed(message));
            }
        }
    }

    async fn on_command(&self, command: SessionCommand) {
        match command {
            SessionCommand::Retry => {
                if self.status() != SessionStatus::Error {
                    return;
                }
                if self.backend_up.load(Ordering::SeqCst) {
                    info!(target_port = self.target_port, "Retrying proxy start");
                    self.connect_proxy().await;
                    return;
                }
                info!(target_port = self.target_port, "Restarting devtools backend");
                self.backend.stop_server();
                if let Err(e) = self.backend.start_server(
                    self.backend_port,
                    &self.backend_host,
                    self.backend_events.clone(),
                ) {
                    self.publish(SessionState::failed(e.to_string()));
                }
            }
        }
    }
}

async fn run(
    session: Arc<Session>,
    mut backend_rx: mpsc::UnboundedReceiver<BackendEvent>,
    mut commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    loop {
        tokio::select! {
            Some(event) = backend_rx.recv() => session.on_backend_event(event).await,
            Some(command) = commands_rx.recv() => session.on_command(command).await,
            else => break,
        }
    }
}
