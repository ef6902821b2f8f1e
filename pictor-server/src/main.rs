//! # Pictor Server
//!
//! HTTP and websocket surface for the Pictor extension host: a runtime that
//! installs, starts, supervises, and routes events to third-party extension
//! processes for an image-management server.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - PostgreSQL for per-extension state (features, tags, settings)
//! - `pictor-core` for the registry, installer, supervisor, router,
//!   throttling scheduler, and synchronisation engine
//! - a websocket endpoint for the persistent extension connections

/// Versioned route organization
pub mod routes;

/// Request handlers
pub mod handlers;

/// Error types and handling
pub mod errors;

/// Shared application state
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pictor_core::auth::InMemoryAuthGuard;
use pictor_core::host::{ExtensionHost, HostStores};
use pictor_core::persistence::memory::{
    MemoryAttachmentStore, MemoryComputeResultStore, MemoryImageCatalog,
    MemorySettingsStore, MemoryVectorStore,
};
use pictor_core::persistence::postgres::{
    PostgresAttachmentStore, PostgresComputeResultStore,
    PostgresImageCatalog, PostgresSettingsStore,
};
use pictor_core::provision::CommandProvisioner;

use crate::state::AppState;

/// Command line arguments for the Pictor server
#[derive(Parser, Debug)]
#[command(name = "pictor-server")]
#[command(about = "Extension host for an image-management server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "PICTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = pictor_config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    for warning in pictor_config::validate(&config) {
        warn!("config: {warning}");
    }
    config.ensure_directories()?;

    let stores = match &config.database.url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections.unwrap_or(8))
                .connect(url)
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("connected to postgres");
            HostStores {
                catalog: Arc::new(PostgresImageCatalog::new(pool.clone())),
                features: Arc::new(PostgresComputeResultStore::features(
                    pool.clone(),
                )),
                tags: Arc::new(PostgresComputeResultStore::tags(
                    pool.clone(),
                )),
                settings: Arc::new(PostgresSettingsStore::new(pool.clone())),
                attachments: Arc::new(PostgresAttachmentStore::new(pool)),
                // The vector backend is an external collaborator; until one
                // is wired in, collections live in process memory.
                vectors: Arc::new(MemoryVectorStore::new()),
            }
        }
        None => {
            warn!("no database configured, using in-memory state stores");
            HostStores {
                catalog: Arc::new(MemoryImageCatalog::new()),
                features: Arc::new(MemoryComputeResultStore::new()),
                tags: Arc::new(MemoryComputeResultStore::new()),
                settings: Arc::new(MemorySettingsStore::new()),
                attachments: Arc::new(MemoryAttachmentStore::new()),
                vectors: Arc::new(MemoryVectorStore::new()),
            }
        }
    };

    let host = ExtensionHost::new(
        config.extensions.clone(),
        stores,
        Arc::new(CommandProvisioner::new()),
        Arc::new(InMemoryAuthGuard::new()),
    );
    host.startup().await?;

    #[cfg(unix)]
    if let Some(unpacked_root) = &config.extensions.unpacked_root {
        use pictor_core::watcher::{UnpackedLifecycle, UnpackedWatcher};
        let lifecycle: Arc<dyn UnpackedLifecycle> =
            Arc::new(Arc::clone(&host));
        let watcher = UnpackedWatcher::new(
            config.watch.clone(),
            unpacked_root,
            lifecycle,
        );
        let installed = watcher.scan_and_install().await?;
        info!(count = installed.len(), "unpacked extensions linked");
    }

    let state = AppState {
        host: Arc::clone(&host),
        config: Arc::new(config.clone()),
    };

    let app = routes::create_api_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("pictor-server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop every extension before the process exits.
    host.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("failed to install SIGTERM handler")
        .recv()
        .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
