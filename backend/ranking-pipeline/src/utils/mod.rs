// Utility functions for ranking-pipeline

use crate::config::Config;
use crate::error::{PipelineError, Result};
use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Run a fallible future under a deadline. Elapsing is reported as
/// `PipelineError::Timeout` naming the operation.
pub async fn with_deadline<F, T>(duration: Duration, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(format!(
            "{} timed out after {:?}",
            operation, duration
        ))),
    }
}

/// Drop repeated items, keeping the first occurrence of each
pub fn dedup_preserving_order<T, I>(items: I) -> Vec<T>
where
    T: Eq + Hash + Clone,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the configured
/// level; calling this twice is a no-op.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
