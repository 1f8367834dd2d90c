use axum::{response::Json, routing::get, Router};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, level_filters::LevelFilter, warn};

mod adapters;
mod api;
mod composer;
mod config;
mod db;
mod events;
mod media;
mod reconcile;
mod scheduler;
mod storage;
mod tasks;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let config = config::Config::from_env();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(db::Database::new(&config.db_path)?);
    info!("database initialized at {:?}", config.db_path);

    let bus = Arc::new(events::EventBus::new());
    let tasks = Arc::new(tasks::TaskManager::new(db.clone(), bus.clone()));
    let swept = tasks.recover_interrupted()?;
    if swept > 0 {
        warn!(swept, "failed tasks interrupted by previous shutdown");
    }

    let adapter = Arc::new(adapters::HttpAdapter::new(config.adapter_base_url.clone()));
    let public_base = format!("http://127.0.0.1:{}/media", config.port);
    let storage = Arc::new(storage::LocalStorage::new(
        config.media_dir.clone(),
        public_base,
    )?);
    let composer = Arc::new(composer::Composer::new(
        storage,
        config.media_dir.join("work"),
        config.duration_tolerance_secs,
    ));
    let scheduler = Arc::new(scheduler::Scheduler::new(
        config.clone(),
        db.clone(),
        tasks.clone(),
        adapter,
        composer,
    ));

    let state = api::ApiState {
        db,
        bus,
        tasks,
        scheduler,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let app = Router::new()
        .route("/health", get(health))
        .nest_service("/media", ServeDir::new(&config.media_dir))
        .nest("/api", api::router(state))
        .layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("starting reelsmith daemon on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
