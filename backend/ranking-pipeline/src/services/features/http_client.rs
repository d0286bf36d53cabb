// ============================================
// HTTP online feature store client
// ============================================
// Posts identifier values and fully-qualified feature names to the online
// feature endpoint and decodes the column-oriented response.

use super::store::{validate_store_feature_names, FeatureStoreClient};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::models::{FeatureData, FeatureMap, FeatureValue, Identifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Serialize)]
struct OnlineFeaturesRequest<'a> {
    features: &'a [String],
    entities: OnlineFeatureEntities<'a>,
    full_feature_names: bool,
}

#[derive(Debug, Serialize)]
struct OnlineFeatureEntities<'a> {
    #[serde(rename = "IDENTIFIER")]
    identifier: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OnlineFeaturesResponse {
    metadata: OnlineFeaturesMetadata,
    results: Vec<OnlineFeatureColumn>,
}

#[derive(Debug, Deserialize)]
struct OnlineFeaturesMetadata {
    feature_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OnlineFeatureColumn {
    values: Vec<serde_json::Value>,
}

pub struct HttpFeatureStoreClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpFeatureStoreClient {
    pub fn new(
        base_url: &str,
        online_path: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(PipelineError::Configuration(
                "feature store API key is required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), online_path),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.feature_store_api_key.clone().ok_or_else(|| {
            PipelineError::Configuration("FEATURE_STORE_API_KEY is not set".to_string())
        })?;
        Self::new(
            &config.feature_store_url,
            &config.feature_store_online_path,
            api_key,
            config.feature_store_timeout(),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl FeatureStoreClient for HttpFeatureStoreClient {
    async fn fetch(
        &self,
        identifiers: &[Identifier],
        feature_names: &[String],
    ) -> Result<FeatureMap> {
        if feature_names.is_empty() || identifiers.is_empty() {
            return Ok(FeatureMap::new());
        }
        validate_store_feature_names(feature_names)?;

        let request = OnlineFeaturesRequest {
            features: feature_names,
            entities: OnlineFeatureEntities {
                identifier: identifiers.iter().map(|id| id.value()).collect(),
            },
            full_feature_names: true,
        };

        debug!(endpoint = %self.endpoint, features = feature_names.len(), "requesting online features");

        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::FeatureStore(format!(
                "online features request failed with {}: {}",
                status, body
            )));
        }

        let body: OnlineFeaturesResponse = response.json().await?;
        decode_response(identifiers, body)
    }
}

/// Column 0 carries identifier values; the remaining columns are features.
/// Stores that flatten names render `view:feature` as `view__feature`.
fn decode_response(identifiers: &[Identifier], body: OnlineFeaturesResponse) -> Result<FeatureMap> {
    if body.metadata.feature_names.len() != body.results.len() {
        return Err(PipelineError::FeatureStore(format!(
            "response carries {} feature names for {} columns",
            body.metadata.feature_names.len(),
            body.results.len()
        )));
    }

    let Some((id_column, feature_columns)) = body.results.split_first() else {
        return Ok(FeatureMap::new());
    };
    let names: Vec<String> = body
        .metadata
        .feature_names
        .iter()
        .skip(1)
        .map(|name| name.replacen("__", ":", 1))
        .collect();

    let mut by_value: HashMap<&str, Vec<&Identifier>> = HashMap::new();
    for identifier in identifiers {
        by_value.entry(identifier.value()).or_default().push(identifier);
    }

    let mut map = FeatureMap::new();
    for (row, id_value) in id_column.values.iter().enumerate() {
        let Some(id_value) = id_value.as_str() else {
            warn!(row, "skipping feature row without a string identifier");
            continue;
        };
        let Some(targets) = by_value.get(id_value) else {
            warn!(identifier = %id_value, "feature store returned an unrequested identifier");
            continue;
        };

        for identifier in targets {
            let mut data = FeatureData::new((*identifier).clone());
            for (name, column) in names.iter().zip(feature_columns) {
                let value = column
                    .values
                    .get(row)
                    .map(FeatureValue::from_json)
                    .unwrap_or(FeatureValue::Absent);
                data.features.insert(name.clone(), value);
            }
            map.apply(data);
        }
    }

    Ok(map)
}
