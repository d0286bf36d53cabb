use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Identity stamped on logged events
    pub service_name: String,

    // Observability
    pub log_level: String,
    pub log_json: bool,

    // Online feature store
    pub feature_store_url: String,
    pub feature_store_online_path: String,
    pub feature_store_api_key: Option<String>,
    pub feature_store_timeout_ms: u64,

    // Model inference
    pub model_batch_size: usize,
    pub model_timeout_ms: u64,

    // Failure isolation
    pub handle_feature_exceptions: bool,
    pub handle_inference_exceptions: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("service_name", "ranking-pipeline")?
            .set_default("log_level", "info")?
            .set_default("log_json", false)?
            .set_default("feature_store_url", "http://localhost:8080")?
            .set_default("feature_store_online_path", "/feature/get-online-features")?
            .set_default("feature_store_timeout_ms", 60_000)? // 60 seconds
            .set_default("model_batch_size", 30)?
            .set_default("model_timeout_ms", 60_000)?
            .set_default("handle_feature_exceptions", false)?
            .set_default("handle_inference_exceptions", false)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.feature_store_url.is_empty() {
            return Err(anyhow!("Feature store URL is required"));
        }

        if !self.feature_store_online_path.starts_with('/') {
            return Err(anyhow!("Feature store online path must start with '/'"));
        }

        if self.feature_store_timeout_ms == 0 {
            return Err(anyhow!("Feature store timeout must be greater than 0"));
        }

        if self.model_batch_size == 0 || self.model_batch_size > 1000 {
            return Err(anyhow!("Model batch size must be between 1 and 1000"));
        }

        if self.model_timeout_ms == 0 {
            return Err(anyhow!("Model timeout must be greater than 0"));
        }

        Ok(())
    }

    pub fn feature_store_timeout(&self) -> Duration {
        Duration::from_millis(self.feature_store_timeout_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}
