//! Runway Server
//!
//! Serves deployed apps and plugins over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runway::apps::VersionResolver;
use runway::config::RuntimeConfig;
use runway::plugin::{builtin, PluginRegistry};
use runway::pool::{ThreadWorkerFactory, WorkerPool};
use runway::server::{AppState, create_router};

/// Runway application server
#[derive(Parser, Debug)]
#[command(name = "runway")]
#[command(about = "Runway application server", long_about = None)]
struct Args {
    /// Path to the config file (defaults to ./runway.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host address
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// App search root; repeat for several (the first receives deployments)
    #[arg(long = "apps-dir")]
    apps_dirs: Vec<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runway=info,runway_worker=info,tower_http=info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    info!("Starting Runway server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RuntimeConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.apps_dirs.is_empty() {
        config.apps_dirs = args.apps_dirs;
    }
    config.validate()?;
    tokio::fs::create_dir_all(config.deploy_root())
        .await
        .with_context(|| format!("Failed to create {}", config.deploy_root().display()))?;

    // Plugins, in config order
    let mut registry = PluginRegistry::new();
    for entry in &config.plugins {
        let plugin = builtin::create(entry)?;
        registry
            .register(plugin)
            .with_context(|| format!("Failed to register plugin '{}'", entry.name))?;
    }
    let registry = Arc::new(registry);
    info!("Registered {} plugins", registry.len());

    let factory = Arc::new(ThreadWorkerFactory::new(config.worker.clone()));
    let pool = Arc::new(WorkerPool::new(
        config.pool.clone(),
        factory,
        registry.clone(),
    ));

    registry
        .init_all(pool.clone())
        .await
        .context("Plugin initialization failed")?;

    // Apps deployed before a plugin claimed their path keep their files but
    // are shadowed by the plugin.
    let resolver = VersionResolver::new(config.apps_dirs.clone());
    match resolver.all().await {
        Ok(apps) => {
            for (app, plugin) in registry.conflicts(&apps) {
                warn!("App '{}' is shadowed by plugin '{}'", app, plugin);
            }
        }
        Err(e) => warn!("Failed to scan apps: {}", e),
    }

    let sweeper = pool.start_sweeper();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid listen address")?;
    let state = AppState::new(config, registry.clone(), pool.clone());
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Server listening on http://{}", local_addr);
    registry.run_on_server_start(local_addr).await;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down workers...");
    sweeper.stop().await;
    pool.shutdown().await;
    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
