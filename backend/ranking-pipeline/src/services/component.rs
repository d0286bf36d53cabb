// ============================================
// Component lifecycle
// ============================================
// Every pipeline stage is a Component: it has a name, a static set of
// feature names it needs, and a one-time initialize hook that runs after
// the hooks of its upstream components.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use tokio::sync::OnceCell;
use tracing::debug;

static NO_FEATURES: BTreeSet<String> = BTreeSet::new();

/// Once-only gate for `initialize`. Concurrent first callers wait on the
/// same initialization; a failed attempt leaves the gate open for a retry.
#[derive(Debug, Default)]
pub struct InitGate {
    cell: OnceCell<()>,
}

impl InitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn run<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.cell.get_or_try_init(init).await.map(|_| ())
    }
}

#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn init_gate(&self) -> &InitGate;

    /// Fully-qualified feature names this component reads. Fixed at
    /// construction.
    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        &NO_FEATURES
    }

    /// One-time setup hook. Call `ensure_initialized` instead of this.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Initialize the components this one depends on
    async fn initialize_upstreams(&self) -> Result<()> {
        Ok(())
    }

    /// Run upstream initialization, then `initialize`, exactly once
    async fn ensure_initialized(&self) -> Result<()> {
        self.init_gate()
            .run(|| async {
                self.initialize_upstreams().await?;
                self.initialize().await?;
                debug!(component = %self.name(), "component initialized");
                Ok(())
            })
            .await
    }
}
