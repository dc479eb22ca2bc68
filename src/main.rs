//! Flagwatch - feature flag impact monitoring server
//!
//! Records flag configuration changes and runtime performance metrics,
//! detects anomalies by comparing recent metric windows against baselines,
//! and produces LLM-generated risk assessments for each change. A websocket
//! channel fans detections and predictions out to live subscribers and hosts
//! a conversational assistant over the same model contract.

mod config;
mod db;
mod engine;
mod error;
mod handlers;
mod models;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engine::llm::OpenAiClient;
use engine::Engine;

pub use error::{AppError, AppResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flagwatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env();

    tracing::info!("Flagwatch server starting...");
    tracing::info!("Database: {}", config.database_url);

    // Initialize database
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Applying database schema...");
    db::run_migrations(&pool)
        .await
        .context("Failed to apply schema")?;

    // Build application state: one engine behind one lock (single-actor model)
    let llm = Box::new(OpenAiClient::new(&config));
    let state = AppState {
        engine: Arc::new(Mutex::new(Engine::new(pool, llm))),
        config: config.clone(),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind listener")?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<Engine>>,
    pub config: config::Config,
}

/// Create the main router with all routes
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::check))
        // Flags
        .route("/api/v1/flags", get(handlers::flags::list))
        .route("/api/v1/flags", post(handlers::flags::create))
        .route("/api/v1/flags/:id", get(handlers::flags::get))
        .route("/api/v1/flags/:id/changes", post(handlers::flags::record_change))
        .route("/api/v1/flags/:id/analyze", post(handlers::flags::analyze))
        // Metrics
        .route("/api/v1/metrics", post(handlers::metrics::ingest))
        // Anomalies
        .route("/api/v1/anomalies", get(handlers::anomalies::list))
        .route("/api/v1/anomalies/:id/resolve", put(handlers::anomalies::resolve))
        // Predictions
        .route("/api/v1/predictions", get(handlers::predictions::list))
        // Streaming channel
        .route("/api/v1/ws", get(handlers::ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
