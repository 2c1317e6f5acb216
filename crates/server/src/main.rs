//! AtomVault HTTP boundary — thin axum wrapper over the `Engine` facade.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use atomvault_core::engine::Engine;
use atomvault_server::api::{self, AppContext};

#[derive(Parser)]
#[command(name = "atomvault-server", version, about)]
struct Cli {
    /// Vault root directory (contains inbox/, external-inbox/, .atomvault/)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atomvault=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let engine = match Engine::new(cli.root.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, root = %cli.root.display(), "failed to open vault");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.start_watching().await {
        error!(error = %e, "failed to start filesystem watcher");
        std::process::exit(1);
    }

    let ctx = AppContext { engine, start_time: Instant::now() };

    let app = Router::new()
        .route("/healthz", get(api::api_health))
        .route("/api/ingest", post(api::api_ingest))
        .route("/api/search", get(api::api_search))
        .route("/api/buckets", get(api::api_list_buckets))
        .route("/api/tags", get(api::api_list_tags))
        .route(
            "/api/watch",
            get(api::api_list_watches).post(api::api_add_watch).delete(api::api_remove_watch),
        )
        .route("/api/atoms/{atom_id}/quarantine", post(api::api_quarantine_atom))
        .route("/api/atoms/{atom_id}/restore", post(api::api_restore_atom))
        .route("/api/molecules/{molecule_id}/content", post(api::api_update_molecule_content))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());
    let port = explicit_port.unwrap_or(8732);

    let listener = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
        error!(port, error = %e, "could not bind to port");
        std::process::exit(1);
    });

    info!(port, "http://{bind_addr}:{port}");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();
}
