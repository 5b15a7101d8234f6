use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgfleet::app::AppContext;
use pgfleet::collector::{self, seed_info};
use pgfleet::model::ClusterStatus;
use pgfleet::{ConnectionRegistry, SharedState, config, http, metrics};

#[derive(Debug, Parser)]
#[command(author, version, about = "pgfleet: PostgreSQL fleet monitor")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env PGFLEET_CONFIG or /config/pgfleet.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = metrics::AppMetrics::new()?;
    let state = SharedState::new();
    let registry = ConnectionRegistry::new(
        config.timeouts.clone(),
        config.security.read_only_enforce,
    );
    let endpoints = config.clusters.clone();

    let ctx = AppContext::new(config, registry, metrics, state);

    for endpoint in endpoints {
        let id = endpoint.id.clone();
        ctx.cluster_info.register_cluster(seed_info(&endpoint)).await;
        match ctx.registry.add_cluster(endpoint.clone()).await {
            Ok(()) => {}
            Err(err) => {
                // Keep it visible as unhealthy; the rest of the fleet still starts.
                error!(cluster = %id, error = %err, "failed to register cluster");
                ctx.cluster_info.mark_unhealthy(&endpoint).await;
                ctx.metrics.set_cluster_status(&id, ClusterStatus::Unhealthy);
            }
        }
    }

    let registered = ctx.registry.list_cluster_ids().await.len();
    if registered == 0 {
        warn!("no cluster could be registered; serving API in degraded mode");
    } else {
        info!(clusters = registered, "connection registry ready");
    }

    let shutdown = CancellationToken::new();
    let collector_handles = collector::spawn_all(ctx.clone(), shutdown.clone());
    let router = http::create_router(ctx.clone());

    info!("pgfleet listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    shutdown.cancel();
    join_collectors(collector_handles).await;
    ctx.registry.close().await;

    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pgfleet=info,axum::rejection=trace"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    if std::env::var("PGFLEET_LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = ?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

/// Wait for in-flight ticks to finish after cancellation.
async fn join_collectors(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = ?err, "collector loop ended abnormally");
        }
    }
    info!("collector loops stopped");
}
