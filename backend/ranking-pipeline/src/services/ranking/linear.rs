use super::{ModelComponent, ModelInput, ModelScore};
use crate::error::Result;
use crate::models::Entity;
use crate::services::component::{Component, InitGate};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Weighted sum of numeric features. Missing or non-numeric features count
/// as zero; an entity with no numeric feature at all is left unscored.
pub struct LinearModel {
    name: String,
    weights: Vec<(String, f64)>,
    bias: f64,
    manifest: BTreeSet<String>,
    gate: InitGate,
}

impl LinearModel {
    pub fn new<I, S>(name: impl Into<String>, weights: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let weights: Vec<(String, f64)> = weights
            .into_iter()
            .map(|(feature, weight)| (feature.into(), weight))
            .collect();
        let manifest = weights.iter().map(|(feature, _)| feature.clone()).collect();

        Self {
            name: name.into(),
            weights,
            bias: 0.0,
            manifest,
            gate: InitGate::new(),
        }
    }

    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }
}

#[async_trait]
impl Component for LinearModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        &self.manifest
    }
}

#[async_trait]
impl ModelComponent for LinearModel {
    async fn batch_inference(
        &self,
        input: ModelInput<'_>,
        batch: &[Arc<dyn Entity>],
    ) -> Result<Vec<Option<ModelScore>>> {
        Ok(batch
            .iter()
            .map(|entity| {
                let mut seen = false;
                let mut score = self.bias;
                for (feature, weight) in &self.weights {
                    if let Some(value) = input
                        .features
                        .feature(entity.identifier(), feature)
                        .and_then(|v| v.as_f64())
                    {
                        seen = true;
                        score += value * weight;
                    }
                }
                seen.then_some(ModelScore::Float(score))
            })
            .collect())
    }
}
