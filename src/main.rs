//! DevTools proxy
//!
//! Runs a devtools session for one local dev server and serves the rewritten
//! pages on a proxy port until interrupted.

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use devtools_proxy::backend::DevtoolsBackend;
use devtools_proxy::config::{
    DEFAULT_BACKEND_HOST, DEFAULT_BACKEND_PORT, DEFAULT_PROXY_ATTEMPTS, DEFAULT_PROXY_BASE_PORT,
    DEFAULT_PROXY_HOST,
};
use devtools_proxy::{
    intercept_response, ActiveSessionEvent, ExternalProcessBackend, InjectionOptions,
    ManagerConfig, ProxyConfig, ProxyOnlyBackend, SessionManager,
};
use hyper::header::{
    HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_SECURITY_POLICY, CONTENT_TYPE,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "devtools-proxy",
    version,
    about = "Reverse proxy that attaches React DevTools to local dev servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a devtools session for a dev server and serve it through the proxy
    Serve(ServeArgs),
    /// Run the HTML interceptor on a file and print the rewritten document
    Inject(InjectArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Port of the local dev server to proxy
    #[arg(long, env = "DEVTOOLS_PROXY_TARGET_PORT")]
    target_port: u16,
    /// Command starting the DevTools backend; `{port}` is replaced with the backend port
    #[arg(long, env = "DEVTOOLS_PROXY_BACKEND_COMMAND")]
    backend_command: Option<String>,
    /// Host the proxy binds to
    #[arg(long, env = "DEVTOOLS_PROXY_HOST", default_value = DEFAULT_PROXY_HOST)]
    host: String,
    /// First port tried by the proxy
    #[arg(long, env = "DEVTOOLS_PROXY_BASE_PORT", default_value_t = DEFAULT_PROXY_BASE_PORT)]
    proxy_base_port: u16,
    /// Number of consecutive ports tried before giving up
    #[arg(long, env = "DEVTOOLS_PROXY_ATTEMPTS", default_value_t = DEFAULT_PROXY_ATTEMPTS)]
    proxy_attempts: u16,
    /// Port suggested to the first DevTools backend
    #[arg(long, env = "DEVTOOLS_PROXY_BACKEND_PORT", default_value_t = DEFAULT_BACKEND_PORT)]
    backend_port: u16,
    /// Host the DevTools backend is reachable at from the page
    #[arg(long, env = "DEVTOOLS_PROXY_BACKEND_HOST", default_value = DEFAULT_BACKEND_HOST)]
    backend_host: String,
    /// Print session info as JSON once the proxy is up
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct InjectArgs {
    /// HTML file to rewrite
    #[arg(long)]
    path: PathBuf,
    /// Content-Security-Policy header of the response (optional)
    #[arg(long)]
    csp: Option<String>,
    /// Content-Encoding of the file contents (gzip, deflate, br)
    #[arg(long)]
    encoding: Option<String>,
    /// Backend port written into the loader URL
    #[arg(long, default_value_t = DEFAULT_BACKEND_PORT)]
    backend_port: u16,
    /// Backend host written into the loader URL
    #[arg(long, default_value = DEFAULT_BACKEND_HOST)]
    backend_host: String,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the proxy URL and rewritten documents
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("devtools_proxy=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Inject(args) => run_inject(args),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = ManagerConfig {
        proxy: ProxyConfig {
            host: args.host.clone(),
            base_port: args.proxy_base_port,
            max_attempts: args.proxy_attempts,
        },
        default_backend_port: args.backend_port,
        backend_host: args.backend_host.clone(),
    };

    let backend_command = args.backend_command.clone();
    let factory = move || -> Box<dyn DevtoolsBackend> {
        match &backend_command {
            Some(command) => Box::new(ExternalProcessBackend::new(command.clone())),
            None => Box::new(ProxyOnlyBackend::new()),
        }
    };
    let manager = SessionManager::new(config, factory);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        info!(target_port = args.target_port, "Starting devtools proxy");
        let log_task = tokio::spawn(log_active_events(manager.subscribe()));

        let started = tokio::select! {
            res = manager.start_or_get_session(args.target_port) => Some(res),
            _ = wait_for_shutdown_signal() => None,
        };
        let result = match started {
            Some(Ok(proxy_port)) => serve_until_signal(&manager, &args, proxy_port).await,
            Some(Err(e)) => {
                error!(target_port = args.target_port, error = %e, "Devtools session failed");
                Err(anyhow::Error::new(e))
            }
            None => {
                info!("Shutdown signal received before the session was ready");
                Ok(())
            }
        };

        manager.shutdown_all().await;
        log_task.abort();
        result
    })
}

async fn serve_until_signal(
    manager: &SessionManager,
    args: &ServeArgs,
    proxy_port: u16,
) -> anyhow::Result<()> {
    println!("http://localhost:{proxy_port}");
    if args.json {
        let session = manager.get_session(args.target_port).await?;
        println!("{}", serde_json::to_string_pretty(&session.info())?);
    }
    if wait_for_shutdown_signal().await.is_ok() {
        info!("Shutdown signal received");
    } else {
        warn!("Shutdown signal handler failed; shutting down");
    }
    Ok(())
}

/// Log every event of the active session.
async fn log_active_events(mut events: broadcast::Receiver<ActiveSessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => info!(target_port = event.target_port, event = ?event.event, "Session event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped = skipped, "Dropped session events"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn run_inject(args: InjectArgs) -> anyhow::Result<()> {
    let body = std::fs::read(&args.path)?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    if let Some(csp) = &args.csp {
        headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_str(csp)?);
    }
    if let Some(encoding) = &args.encoding {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_str(encoding)?);
    }

    let options = InjectionOptions {
        backend_host: args.backend_host,
        backend_port: args.backend_port,
    };
    let intercepted = intercept_response(&headers, Bytes::from(body), &options);
    info!(outcome = ?intercepted.outcome, path = %args.path.display(), "Interceptor finished");
    if let Some(csp) = intercepted.headers.get(CONTENT_SECURITY_POLICY) {
        info!(csp = %String::from_utf8_lossy(csp.as_bytes()), "Rewritten Content-Security-Policy");
    }

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&intercepted.body)?;
    stdout.flush()?;
    Ok(())
}
