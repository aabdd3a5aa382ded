//! dockupd: the dockup daemon.
//!
//! # Usage
//!
//! ```text
//! dockupd --port 5000 --db-path /data/versions.redb
//! ```
//!
//! Every flag can also be given through its environment variable
//! (`PORT`, `DB_PATH`, `CHECK_INTERVAL`, ...).

use std::net::SocketAddr;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dockup_registry::ChangelogResolver;
use dockupd::{Collaborators, Config, Daemon, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "dockup daemon starting");

    let orchestrator = config.orchestrator()?;
    let changelogs = ChangelogResolver::new(config.changelog_urls()?);
    let collaborators = Collaborators::from_config(&config)?;
    let store = Daemon::open_store(&config.db_path)?;
    let daemon = Daemon::start(store, collaborators, orchestrator, changelogs)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    let server = axum::serve(listener, daemon.router()).with_graceful_shutdown(async {
        shutdown_signal().await;
        info!("shutdown signal received");
    });
    let served = server.await;

    daemon.stop().await?;
    info!("dockup daemon stopped");
    served.map_err(Into::into)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Ctrl-C, or SIGTERM from `docker stop`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
