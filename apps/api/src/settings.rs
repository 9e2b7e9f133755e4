//! Model settings cache: which model serves each pipeline phase.
//!
//! Settings live in `app_settings` and are read through an injected cache so
//! admin edits take effect after `invalidate()` without a process restart.
//! Reads are best-effort: a lookup failure falls back to the default model
//! rather than failing the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::warn;

/// Pipeline phases that resolve their model through settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Extraction,
    Classification,
    SectionBatch,
}

impl ModelRole {
    fn setting_key(&self) -> &'static str {
        match self {
            ModelRole::Extraction => "model.extraction",
            ModelRole::Classification => "model.classification",
            ModelRole::SectionBatch => "model.section_batch",
        }
    }
}

#[derive(Clone)]
pub struct ModelSettingsCache {
    pool: PgPool,
    default_model: String,
    cache: Arc<RwLock<HashMap<&'static str, String>>>,
}

impl ModelSettingsCache {
    pub fn new(pool: PgPool, default_model: String) -> Self {
        Self {
            pool,
            default_model,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolves the model for a role, hitting the database only on a cache
    /// miss. Missing rows and read errors resolve to the default model.
    pub async fn model_for(&self, role: ModelRole) -> String {
        let key = role.setting_key();

        if let Some(cached) = self.cache.read().await.get(key) {
            return cached.clone();
        }

        let looked_up: Option<String> =
            match sqlx::query_scalar("SELECT value FROM app_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    warn!("Model setting lookup failed for {key}: {e}");
                    None
                }
            };

        let model = looked_up.unwrap_or_else(|| self.default_model.clone());
        self.cache.write().await.insert(key, model.clone());
        model
    }

    /// Drops every cached entry. The next lookup per role re-reads the table.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, role: ModelRole, model: &str) {
        self.cache
            .write()
            .await
            .insert(role.setting_key(), model.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ModelSettingsCache {
        // Lazy pool: never connects unless a cache miss reaches the database.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        ModelSettingsCache::new(pool, "default-model".to_string())
    }

    #[tokio::test]
    async fn test_seeded_entries_are_served_without_db() {
        let settings = cache();
        settings.seed(ModelRole::Extraction, "fast-model").await;
        assert_eq!(settings.model_for(ModelRole::Extraction).await, "fast-model");
    }

    #[tokio::test]
    async fn test_invalidate_clears_seeded_entries() {
        let settings = cache();
        settings.seed(ModelRole::Classification, "old-model").await;
        settings.invalidate().await;
        assert!(settings.cache.read().await.is_empty());
    }

    #[test]
    fn test_roles_map_to_distinct_keys() {
        let keys = [
            ModelRole::Extraction.setting_key(),
            ModelRole::Classification.setting_key(),
            ModelRole::SectionBatch.setting_key(),
        ];
        assert_eq!(keys.len(), 3);
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
    }
}
