use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

use parley_hub::auth::{AuthHook, PermissiveAuth, SharedSecretAuth};
use parley_hub::config::{HubConfig, load_config};
use parley_hub::hub::HubManager;
use parley_hub::metrics::HubMetrics;
use parley_hub::storage::MemoryStorage;
use parley_hub::{AppState, build_router};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Multi-participant AI conversation hub")]
struct Args {
    /// Host to bind to
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP server
    #[arg(short, long, default_value = "4400")]
    port: u16,

    /// Path to a parley.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Require this shared secret as the handshake token
    #[arg(long)]
    shared_secret: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "parley=debug,tower_http=debug,info"
    } else {
        "parley=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Parley conversation hub");

    let file_config = load_config(args.config.as_deref())?;
    let hub_config = HubConfig::from_file(&file_config.hub);

    let host = file_config.server.host.unwrap_or(args.host);
    let port = file_config.server.port.unwrap_or(args.port);

    let metrics = Arc::new(HubMetrics::new());
    let storage = Arc::new(MemoryStorage::new());
    let manager = HubManager::new(hub_config, storage, metrics);
    manager.start_background_tasks();

    let auth: Arc<dyn AuthHook> = match args.shared_secret {
        Some(secret) => {
            info!("Shared-secret auth enabled");
            Arc::new(SharedSecretAuth::new(secret))
        }
        None => Arc::new(PermissiveAuth),
    };

    let app = build_router(AppState {
        manager: manager.clone(),
        auth,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Parley listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET /ws/{{conversation_id}}?participant_id=... - WebSocket attach");
    info!("  GET /healthz                                 - Health check");
    info!("  GET /metrics                                 - Hub metrics");

    let shutdown_manager = manager.clone();
    let shutdown_signal = async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown_manager.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Parley stopped");
    Ok(())
}
