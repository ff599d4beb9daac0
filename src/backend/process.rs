//! Backend that runs an external DevTools server process.
//!
//! The command line is a template in which `{port}` is replaced with the
//! backend port. The backend counts as connected once that port accepts TCP
//! connections, and reports an error when the process exits.

use super::{BackendEvent, BackendEventSink, BackendStatus, DevtoolsBackend};
use crate::error::BackendError;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for the backend process to start listening.
const READY_TIMEOUT_SECS: u64 = 60;
/// Interval between connection attempts while waiting for the backend.
const READY_POLL_INTERVAL_MS: u64 = 250;

struct Running {
    port: u16,
    token: CancellationToken,
}

pub struct ExternalProcessBackend {
    command: String,
    running: Mutex<Option<Running>>,
}

impl ExternalProcessBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn command_line(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.command
            .split_whitespace()
            .map(|part| part.replace("{port}", &port))
            .collect()
    }
}

impl DevtoolsBackend for ExternalProcessBackend {
    fn start_server(
        &self,
        suggested_port: u16,
        host: &str,
        events: BackendEventSink,
    ) -> Result<(), BackendError> {
        let argv = self.command_line(suggested_port);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BackendError::StartFailed("empty backend command".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::StartFailed(format!("{program}: {e}")))?;

        info!(
            program = %program,
            port = suggested_port,
            pid = child.id().unwrap_or_default(),
            "Spawned devtools backend"
        );

        let token = CancellationToken::new();
        let previous = self.lock_running().replace(Running {
            port: suggested_port,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        tokio::spawn(monitor(child, host.to_string(), suggested_port, events, token));
        Ok(())
    }

    fn stop_server(&self) {
        if let Some(running) = self.lock_running().take() {
            debug!(port = running.port, "Stopping devtools backend");
            running.token.cancel();
        }
    }

    fn current_port(&self) -> Option<u16> {
        self.lock_running().as_ref().map(|r| r.port)
    }

    fn start_inspecting_host(&self) {
        debug!("External devtools backend does not accept inspection commands");
    }

    fn stop_inspecting_host(&self) {}
}

enum Watch {
    Stopped,
    Exited(std::io::Result<ExitStatus>),
    Ready,
    TimedOut,
}

async fn monitor(
    mut child: Child,
    host: String,
    port: u16,
    events: BackendEventSink,
    token: CancellationToken,
) {
    let startup = tokio::select! {
        _ = token.cancelled() => Watch::Stopped,
        exit = child.wait() => Watch::Exited(exit),
        ready = timeout(Duration::from_secs(READY_TIMEOUT_SECS), wait_for_port(&host, port)) => {
            if ready.is_ok() { Watch::Ready } else { Watch::TimedOut }
        }
    };

    match startup {
        Watch::Ready => {
            info!(port = port, "Devtools backend is listening");
            let _ = events.send(BackendEvent::status(
                BackendStatus::ServerConnected,
                format!("Devtools backend listening on port {port}"),
            ));
        }
        Watch::TimedOut => {
            warn!(port = port, "Devtools backend did not start listening in time");
            let _ = events.send(BackendEvent::status(
                BackendStatus::Error,
                format!("Devtools backend did not listen on port {port} within {READY_TIMEOUT_SECS}s"),
            ));
            let _ = child.kill().await;
            return;
        }
        Watch::Exited(exit) => {
            report_exit(&events, exit);
            return;
        }
        Watch::Stopped => {
            let _ = child.kill().await;
            return;
        }
    }

    let running = tokio::select! {
        _ = token.cancelled() => Watch::Stopped,
        exit = child.wait() => Watch::Exited(exit),
    };
    match running {
        Watch::Exited(exit) => report_exit(&events, exit),
        _ => {
            let _ = child.kill().await;
        }
    }
}

async fn wait_for_port(host: &str, port: u16) {
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
    }
}

fn report_exit(events: &BackendEventSink, exit: std::io::Result<ExitStatus>) {
    let message = match exit {
        Ok(status) => format!("Devtools backend exited ({status})"),
        Err(e) => format!("Devtools backend could not be waited on: {e}"),
    };
    warn!("{message}");
    let _ = events.send(BackendEvent::status(BackendStatus::Error, message));
}
