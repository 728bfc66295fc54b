//! kitt-server entry point.
//!
//! This file is intentionally thin: it sets up tracing, opens the ledger,
//! runs crash recovery, wires middleware, and starts the HTTP server. All
//! route handlers live in `routes.rs`; shared state lives in `state.rs`.

use anyhow::Context;
use axum::http::Method;
use kitt_config::ServerSettings;
use kitt_server::{recovery, registry, routes, state::AppState};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = ServerSettings::from_env();
    if settings.admin_token.is_empty() {
        warn!("KITT_ADMIN_TOKEN is not set; operator endpoints are unauthenticated");
    }

    let pool = kitt_db::connect(&settings.db_path).await?;
    let addr = settings.bind_addr;
    let shared = AppState::new(pool, settings);

    recovery::recover(&shared).await?;
    registry::spawn_liveness_sweeper(shared.clone());

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_for_ui());

    info!("kitt-server listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS for browser UIs during development. Agents and the CLI talk
/// server-to-server and never need it.
fn cors_for_ui() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
