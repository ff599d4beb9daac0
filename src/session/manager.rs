//! Session manager: registry keyed by target port plus the active session.

use super::devtools::{Session, SessionOptions};
use super::ports;
use super::types::{InspectionResult, SessionEvent, SessionInfo, SessionStatus};
use crate::backend::{
    BackendFactory, BrowserMetadata, CommandSurface, ScreenshotSource, ShowBrowserOptions,
};
use crate::config::ManagerConfig;
use crate::error::SessionError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the active-session event channel.
const ACTIVE_EVENT_CAPACITY: usize = 128;

/// An event re-broadcast from the currently active session.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSessionEvent {
    pub target_port: u16,
    pub event: SessionEvent,
}

struct ActiveBinding {
    target_port: u16,
    forwarder: JoinHandle<()>,
}

/// Manager for devtools sessions, one per target port.
pub struct SessionManager {
    config: ManagerConfig,
    factory: Box<dyn BackendFactory>,
    screenshots: Option<Arc<dyn ScreenshotSource>>,
    command_surface: Option<Arc<dyn CommandSurface>>,
    /// Map of target port to session.
    sessions: RwLock<HashMap<u16, Arc<Session>>>,
    /// Active session and the task forwarding its events.
    active: Mutex<Option<ActiveBinding>>,
    events: broadcast::Sender<ActiveSessionEvent>,
    /// Most recent non-null inspection result of the active session.
    last_inspected: Arc<StdMutex<Option<InspectionResult>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionManager {
    /// Create a manager that builds a fresh backend from `factory` for every session.
    pub fn new(config: ManagerConfig, factory: impl BackendFactory + 'static) -> Self {
        let (events, _) = broadcast::channel(ACTIVE_EVENT_CAPACITY);
        Self {
            config,
            factory: Box::new(factory),
            screenshots: None,
            command_surface: None,
            sessions: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
            events,
            last_inspected: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn with_screenshots(mut self, source: Arc<dyn ScreenshotSource>) -> Self {
        self.screenshots = Some(source);
        self
    }

    pub fn with_command_surface(mut self, surface: Arc<dyn CommandSurface>) -> Self {
        self.command_surface = Some(surface);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get or create the session for `target_port`, make it active and wait
    /// until its proxy is reachable. Returns the proxy port.
    pub async fn start_or_get_session(&self, target_port: u16) -> Result<u16, SessionError> {
        let (session, created) = self.get_or_create(target_port).await?;
        // The forwarder subscribes here, before a new backend can report.
        self.activate(&session).await;
        if created {
            if let Err(e) = session.start_backend() {
                error!(target_port = target_port, error = %e, "Session startup failed");
                self.forget_session(&session).await;
                return Err(SessionError::SessionFailed);
            }
        }
        wait_until_ready(&session, !created).await
    }

    /// Returns the session and whether it was created by this call. A new
    /// session's backend is not started yet.
    async fn get_or_create(&self, target_port: u16) -> Result<(Arc<Session>, bool), SessionError> {
        if let Some(session) = self.sessions.read().await.get(&target_port) {
            return Ok((session.clone(), false));
        }

        let mut sessions = self.sessions.write().await;
        // Re-check in case another task created it meanwhile
        if let Some(session) = sessions.get(&target_port) {
            return Ok((session.clone(), false));
        }

        let backend_port = ports::suggest_backend_port(
            sessions.values().map(|s| s.current_backend_port()),
            self.config.default_backend_port,
        );
        info!(
            target_port = target_port,
            backend_port = backend_port,
            "Opening new session"
        );

        let options = SessionOptions {
            target_port,
            backend_port,
            backend_host: self.config.backend_host.clone(),
            proxy: self.config.proxy.clone(),
            screenshots: self.screenshots.clone(),
        };
        let session = Session::new(options, self.factory.create());
        sessions.insert(target_port, session.clone());
        Ok((session, true))
    }

    /// Make `session` the active one, releasing the previous forwarder first.
    async fn activate(&self, session: &Arc<Session>) {
        let target_port = session.target_port();
        let mut active = self.active.lock().await;
        if active.as_ref().map(|a| a.target_port) == Some(target_port) {
            return;
        }
        if let Some(previous) = active.take() {
            release_binding(previous).await;
        }
        *lock(&self.last_inspected) = None;

        let mut rx = session.subscribe();
        let events = self.events.clone();
        let last_inspected = self.last_inspected.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let SessionEvent::Inspected(Some(result)) = &event {
                            *lock(&last_inspected) = Some(result.clone());
                        }
                        let _ = events.send(ActiveSessionEvent { target_port, event });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target_port = target_port, skipped = skipped, "Dropped session events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *active = Some(ActiveBinding {
            target_port,
            forwarder,
        });
        info!(target_port = target_port, "Switched active session");
    }

    /// Resolve the proxy port, then ask the command surface to show it.
    pub async fn open_in_browser(&self, target_port: u16) -> Result<(), SessionError> {
        let proxy_port = self.start_or_get_session(target_port).await?;
        let url = format!("http://localhost:{proxy_port}");
        let options = ShowBrowserOptions {
            metadata: BrowserMetadata {
                sessions: self.backend_port_map().await,
            },
            in_preview: true,
        };
        match &self.command_surface {
            Some(surface) => surface
                .show_browser(&url, &options)
                .map_err(SessionError::Command),
            None => {
                info!(url = %url, "No command surface; open the proxy URL manually");
                Ok(())
            }
        }
    }

    /// Subscribe to events of whichever session is active.
    pub fn subscribe(&self) -> broadcast::Receiver<ActiveSessionEvent> {
        self.events.subscribe()
    }

    pub fn last_inspected(&self) -> Option<InspectionResult> {
        lock(&self.last_inspected).clone()
    }

    pub async fn active_target_port(&self) -> Option<u16> {
        self.active.lock().await.as_ref().map(|a| a.target_port)
    }

    pub async fn get_session(&self, target_port: u16) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&target_port)
            .cloned()
            .ok_or(SessionError::SessionNotFound(target_port))
    }

    /// Snapshot of every session, ordered by target port.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Arc<Session>> = sessions.values().cloned().collect();
        all.sort_by_key(|s| s.target_port());
        all
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions().await.iter().map(|s| s.info()).collect()
    }

    /// Backend port to target port for every session.
    pub async fn backend_port_map(&self) -> BTreeMap<u16, u16> {
        let sessions = self.sessions.read().await;
        ports::backend_port_map(
            sessions
                .values()
                .map(|s| (s.target_port(), s.current_backend_port())),
        )
    }

    /// Backend port the next new session would be offered.
    pub async fn suggest_backend_port(&self) -> u16 {
        let sessions = self.sessions.read().await;
        ports::suggest_backend_port(
            sessions.values().map(|s| s.current_backend_port()),
            self.config.default_backend_port,
        )
    }

    /// Remove and dispose one session.
    pub async fn dispose_session(&self, target_port: u16) -> Result<(), SessionError> {
        let session = self.get_session(target_port).await?;
        self.forget_session(&session).await;
        Ok(())
    }

    /// Unregister `session` if it is still the registered one, then dispose it.
    async fn forget_session(&self, session: &Arc<Session>) {
        let target_port = session.target_port();
        // Consistent lock ordering: sessions -> active
        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(&target_port)
                .is_some_and(|s| Arc::ptr_eq(s, session))
            {
                sessions.remove(&target_port);
            }
        }

        let mut active = self.active.lock().await;
        if active.as_ref().map(|a| a.target_port) == Some(target_port) {
            if let Some(binding) = active.take() {
                release_binding(binding).await;
            }
            *lock(&self.last_inspected) = None;
        }
        drop(active);

        session.dispose();
    }

    /// Dispose every session.
    pub async fn shutdown_all(&self) {
        let target_ports: Vec<u16> = self.sessions.read().await.keys().copied().collect();
        for target_port in target_ports {
            if let Err(e) = self.dispose_session(target_port).await {
                warn!(target_port = target_port, error = %e, "Failed to dispose session during shutdown");
            }
        }
    }

    /// Get session statistics.
    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        let active_target_port = self.active.lock().await.as_ref().map(|a| a.target_port);
        SessionStats {
            total_sessions: sessions.len(),
            connected_sessions: sessions
                .values()
                .filter(|s| s.state().ready_port().is_some())
                .count(),
            failed_sessions: sessions
                .values()
                .filter(|s| s.status() == SessionStatus::Error)
                .count(),
            active_target_port,
        }
    }
}

async fn release_binding(binding: ActiveBinding) {
    binding.forwarder.abort();
    // JoinError::Cancelled is the expected outcome.
    let _ = binding.forwarder.await;
    debug!(target_port = binding.target_port, "Released active session forwarder");
}

/// Resolve on the first ready proxy port, reject on `Error` or disposal.
///
/// With `retry_failed`, a session already in `Error` is asked to recover and
/// only a later `Error` rejects.
async fn wait_until_ready(session: &Session, retry_failed: bool) -> Result<u16, SessionError> {
    let mut state = session.watch_state();
    let failed = {
        let current = state.borrow_and_update();
        if let Some(port) = current.ready_port() {
            return Ok(port);
        }
        current.status == SessionStatus::Error
    };
    if failed {
        if !retry_failed {
            return Err(SessionError::SessionFailed);
        }
        session.retry();
    }

    loop {
        state.changed().await?;
        let current = state.borrow_and_update().clone();
        if current.disposed {
            return Err(SessionError::Disposed(session.target_port()));
        }
        if let Some(port) = current.ready_port() {
            return Ok(port);
        }
        if current.status == SessionStatus::Error {
            warn!(
                target_port = session.target_port(),
                error = current.error.as_deref().unwrap_or("unknown"),
                "Devtools session failed"
            );
            return Err(SessionError::SessionFailed);
        }
    }
}

/// Statistics about sessions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub failed_sessions: usize,
    pub active_target_port: Option<u16>,
}
