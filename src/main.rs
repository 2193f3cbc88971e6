mod backend;
mod config;
mod daemon;
mod files;
mod util;

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use backend::{AppState, create_router};
use daemon::{ConnectPolicy, DaemonSupervisor, DownloadGateway, JsonRpcClient, StopGuard};
use files::{FileCatalog, PathGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logs to stdout, and to `<log_dir>/app.log` when that can be opened.
/// Returns the reason the file could not be used, to be logged once the
/// subscriber is up.
fn init_logging(log_dir: &Path) -> Option<std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = std::fs::create_dir_all(log_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("app.log"))
    });
    let (file_layer, file_error) = match log_file {
        Ok(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    file_error
}

/// Stops the daemon when the main thread panics. Handler panics are caught
/// by the router and leave the daemon alone.
fn install_panic_hook(supervisor: Arc<DaemonSupervisor>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if std::thread::current().name() == Some("main") {
            supervisor.stop();
        }
        previous(info);
    }));
}

async fn connect_daemon(
    config: &config::Config,
    supervisor: &DaemonSupervisor,
    guard: &PathGuard,
) -> color_eyre::Result<DownloadGateway> {
    let handle = supervisor.start().await?;
    let transport = JsonRpcClient::new(&handle.endpoint, config.daemon.rpc_timeout())?;
    let policy = ConnectPolicy {
        attempts: config.daemon.connect_attempts,
        backoff: config.daemon.connect_backoff(),
    };
    let gateway = DownloadGateway::connect(Arc::new(transport), guard.clone(), policy).await?;
    Ok(gateway)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    let config = config::config();
    let log_error = init_logging(&config.server.log_dir);
    color_eyre::install()?;
    if let Some(e) = log_error {
        tracing::warn!(
            "Logging to stdout only, cannot write to {}: {}",
            config.server.log_dir.display(),
            e
        );
    }

    tokio::fs::create_dir_all(&config.server.download_dir).await?;
    let guard = PathGuard::new(&config.server.download_dir);
    tracing::info!("Download directory: {}", guard.root().display());

    let supervisor = Arc::new(DaemonSupervisor::new(config.daemon.clone(), guard.root()));
    let _stop_guard = StopGuard(supervisor.clone());
    install_panic_hook(supervisor.clone());

    let gateway = match connect_daemon(&config, &supervisor, &guard).await {
        Ok(gateway) => Some(gateway),
        Err(e) if config.server.require_daemon => {
            tracing::error!("aria2c daemon unavailable, exiting");
            return Err(e);
        }
        Err(e) => {
            tracing::warn!("Running without aria2c daemon: {}", e);
            None
        }
    };

    let state = AppState::new(config.clone(), FileCatalog::new(guard), gateway);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.host).await?;
    tracing::info!("Listening on: {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    supervisor.stop();
    Ok(())
}
