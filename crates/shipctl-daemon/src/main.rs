//! shipctl-daemon entry point.
//!
//! Thin by design: resolve configuration, build shared state, run startup
//! recovery (§4.7), wire middleware, serve. All route handlers live in
//! `routes.rs`; all shared state lives in `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use shipctl_daemon::{routes, state};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly. Silent if absent.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let store_config = shipctl_config::StoreConfig::from_env()?;
    let pool = shipctl_db::connect_from_env().await.context("connecting to database")?;

    if store_config.migrate_on_startup {
        shipctl_db::migrate(&pool).await.context("running migrations")?;
    }

    let mode = shipctl_config::RunMode::from_env()?;
    let secrets = shipctl_config::secrets::resolve_secrets_for_mode(mode)?;

    let carrier: Arc<dyn shipctl_carrier::CarrierAdapter> = match secrets.carrier {
        Some(creds) => Arc::new(shipctl_carrier::UpsCarrier::new(creds)),
        None => Arc::new(shipctl_carrier::PaperCarrier::new()),
    };

    let gateway = Arc::new(shipctl_gateway::DataGateway::new());
    let hub = Arc::new(shipctl_hub::Hub::new());
    let labels = Arc::new(shipctl_config::LabelsConfig::from_env()?);
    let decisions = Arc::new(shipctl_config::DecisionLedgerConfig::from_env()?);

    let orchestrator = Arc::new(shipctl_orchestrator::Orchestrator::new(
        pool.clone(),
        Arc::clone(&carrier),
        Arc::clone(&gateway),
        Arc::clone(&hub),
        secrets.shipper_fallback,
        None,
        decisions,
    ));

    info!("running startup recovery");
    let report = orchestrator
        .run_startup_recovery()
        .await
        .context("startup recovery failed")?;
    info!(jobs_scanned = report.jobs_scanned, "startup recovery complete");

    let shared = Arc::new(state::AppState {
        pool,
        orchestrator,
        hub,
        gateway,
        labels,
        build: state::BuildInfo { service: "shipctl-daemon", version: env!("CARGO_PKG_VERSION") },
    });

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8911)));
    info!("shipctl-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("SHIPCTL_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins (operator UI runs on the same box).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
