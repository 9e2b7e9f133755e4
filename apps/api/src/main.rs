mod config;
mod db;
mod diff;
mod errors;
mod llm_client;
mod models;
mod pipeline;
mod routes;
mod settings;
mod state;
mod storage;
mod tasks;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::settings::ModelSettingsCache;
use crate::state::AppState;
use crate::tasks::ledger::PgTaskStore;
use crate::tasks::recovery::run_recovery_sweep;
use crate::tasks::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    let crate_target = env!("CARGO_PKG_NAME").replace('-', "_");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{crate_target}={}", &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tailor API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Repair work orphaned by the previous process before accepting any new work
    run_recovery_sweep(&db).await?;

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone())?;
    info!("LLM client initialized (default model: {})", config.default_model);

    // Injected model-settings cache; invalidate() picks up admin edits
    let settings = ModelSettingsCache::new(db.clone(), config.default_model.clone());

    // Task Ledger + Scheduler
    let task_store = Arc::new(PgTaskStore::new(db.clone()));
    let scheduler = Scheduler::new(task_store.clone());

    // Build app state
    let state = AppState {
        db,
        llm,
        config: config.clone(),
        settings,
        task_store,
        scheduler,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
