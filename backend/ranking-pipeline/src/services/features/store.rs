use crate::error::{PipelineError, Result};
use crate::models::{FeatureData, FeatureMap, FeatureValue, Identifier, FEATURE_NAME_SEPARATOR};
use crate::utils::{dedup_preserving_order, with_deadline};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Online feature store seen as a single batched call
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeatureStoreClient: Send + Sync {
    /// Values for `identifiers` x `feature_names`. Missing combinations may
    /// simply be left out.
    async fn fetch(&self, identifiers: &[Identifier], feature_names: &[String])
        -> Result<FeatureMap>;
}

/// Feature names the store accepts are qualified `<view>:<feature>`
pub fn validate_store_feature_names<'a, I>(feature_names: I) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    let invalid: Vec<&str> = feature_names
        .into_iter()
        .filter(|name| match name.split_once(FEATURE_NAME_SEPARATOR) {
            Some((view, feature)) => view.is_empty() || feature.is_empty(),
            None => true,
        })
        .map(String::as_str)
        .collect();

    if invalid.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InvalidFeatureName(format!(
            "expected '<view>:<feature>', got {}",
            invalid.join(", ")
        )))
    }
}

/// Store fetch stage: timeout, isolation and completeness around a client
#[derive(Clone)]
pub struct FeatureStoreRetrieval {
    client: Arc<dyn FeatureStoreClient>,
    timeout: Duration,
}

impl FeatureStoreRetrieval {
    pub fn new(client: Arc<dyn FeatureStoreClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch store features for every identifier.
    ///
    /// The result holds every identifier x name combination, absent where
    /// the store had nothing. With `handle_exceptions`, a failed or timed out
    /// call yields an all-absent map instead of an error. Malformed names
    /// are always an error.
    pub async fn fetch(
        &self,
        identifiers: &[Identifier],
        feature_names: &BTreeSet<String>,
        handle_exceptions: bool,
    ) -> Result<FeatureMap> {
        if feature_names.is_empty() {
            return Ok(FeatureMap::new());
        }
        validate_store_feature_names(feature_names)?;

        let identifiers = dedup_preserving_order(identifiers.iter().cloned());
        let names: Vec<String> = feature_names.iter().cloned().collect();

        debug!(
            identifiers = identifiers.len(),
            features = names.len(),
            "fetching store features"
        );

        let outcome = with_deadline(
            self.timeout,
            "feature store fetch",
            self.client.fetch(&identifiers, &names),
        )
        .await;

        match outcome {
            Ok(mut map) => {
                map.fill_absent(&identifiers, &names);
                Ok(map)
            }
            Err(e) if handle_exceptions && e.is_isolatable() => {
                warn!(
                    error = %e,
                    identifiers = identifiers.len(),
                    "feature store fetch failed, continuing with absent values"
                );
                Ok(FeatureMap::with_absent(&identifiers, &names))
            }
            Err(e) => Err(e),
        }
    }
}

/// Store backed by an in-process map
#[derive(Debug, Default)]
pub struct InMemoryFeatureStore {
    features: RwLock<HashMap<Identifier, BTreeMap<String, FeatureValue>>>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feature(
        mut self,
        identifier: &Identifier,
        name: impl Into<String>,
        value: impl Into<FeatureValue>,
    ) -> Self {
        self.features
            .get_mut()
            .entry(identifier.clone())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    pub async fn set_feature(
        &self,
        identifier: &Identifier,
        name: impl Into<String>,
        value: impl Into<FeatureValue>,
    ) {
        self.features
            .write()
            .await
            .entry(identifier.clone())
            .or_default()
            .insert(name.into(), value.into());
    }
}

#[async_trait]
impl FeatureStoreClient for InMemoryFeatureStore {
    async fn fetch(
        &self,
        identifiers: &[Identifier],
        feature_names: &[String],
    ) -> Result<FeatureMap> {
        let features = self.features.read().await;
        let mut map = FeatureMap::new();

        for identifier in identifiers {
            let Some(stored) = features.get(identifier) else {
                continue;
            };
            let mut data = FeatureData::new(identifier.clone());
            for name in feature_names {
                if let Some(value) = stored.get(name) {
                    data.features.insert(name.clone(), value.clone());
                }
            }
            map.apply(data);
        }

        Ok(map)
    }
}
