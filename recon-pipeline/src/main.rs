//! recon-pipeline - 3D reconstruction session service
//!
//! Runs COLMAP structure-from-motion, builds the NeRF scene manifest, trains
//! with instant-ngp and exports a mesh, streaming progress to the client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use recon_common::config::{load_config, resolve_config_source};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recon_pipeline::config::PipelineConfig;
use recon_pipeline::models::SessionStore;
use recon_pipeline::AppState;

/// Command-line arguments for recon-pipeline
#[derive(Parser, Debug)]
#[command(name = "recon-pipeline")]
#[command(about = "3D reconstruction session processing service")]
#[command(version)]
struct Args {
    /// Bootstrap TOML configuration file (falls back to RECON_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides [server].host)
    #[arg(long, env = "RECON_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides [server].port)
    #[arg(short, long, env = "RECON_PORT")]
    port: Option<u16>,

    /// Parent directory of session working directories
    #[arg(short, long, env = "RECON_UPLOAD_ROOT")]
    upload_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let source = resolve_config_source(args.config.as_deref());
    let loaded = load_config(&source).context("Failed to load configuration")?;
    let mut config = loaded.config;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "recon_pipeline={level},recon_common={level},tower_http=info",
                    level = config.logging.level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting recon-pipeline v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    loaded.origin.log();

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(upload_root) = args.upload_root {
        config.server.upload_root = upload_root;
    }

    let sessions = SessionStore::new(&config.server.upload_root)
        .context("Failed to initialize upload root")?;

    let pipeline_config = PipelineConfig::from_toml(&config);
    info!("COLMAP: {}", pipeline_config.colmap.display());
    info!(
        "NeRF: {} {} (in {})",
        pipeline_config.python.display(),
        pipeline_config.nerf_script.display(),
        pipeline_config.nerf_root.display()
    );
    if !pipeline_config.nerf_root.is_dir() {
        warn!(
            "NeRF root {} does not exist; training will fail",
            pipeline_config.nerf_root.display()
        );
    }

    let state = AppState::new(sessions, pipeline_config, config.events.queue_capacity);
    let app = recon_pipeline::build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let cancelled = state.cancel_all().await;
    if cancelled > 0 {
        info!("Cancelled {} running pipeline(s)", cancelled);
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
