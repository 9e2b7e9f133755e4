use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    /// Upper bound on section subtasks running at once within a single offer.
    pub max_parallel_subtasks: usize,
    /// Upper bound on offers of a single generation request processed at once.
    pub max_concurrent_offers: usize,
    /// Fallback model when no setting row overrides a pipeline phase.
    pub default_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            max_parallel_subtasks: parse_env_or("MAX_PARALLEL_SUBTASKS", 3)?,
            max_concurrent_offers: parse_env_or("MAX_CONCURRENT_OFFERS", 2)?,
            default_model: std::env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env_or(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<usize>()
                .with_context(|| format!("{key} must be a positive integer"))?;
            if value == 0 {
                anyhow::bail!("{key} must be at least 1");
            }
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}
