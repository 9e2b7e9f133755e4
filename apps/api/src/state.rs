use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::llm_client::LlmClient;
use crate::settings::ModelSettingsCache;
use crate::tasks::ledger::TaskStore;
use crate::tasks::scheduler::Scheduler;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub llm: LlmClient,
    pub config: Config,
    /// Injected model-settings cache; `invalidate()` after admin edits.
    pub settings: ModelSettingsCache,
    /// Task Ledger behind a trait so scheduler tests can swap the store.
    pub task_store: Arc<dyn TaskStore>,
    pub scheduler: Scheduler,
}
