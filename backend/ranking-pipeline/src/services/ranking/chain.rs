use super::{InferencePolicy, ModelComponent, ModelInput, ModelOutput, ModelScore};
use crate::error::{PipelineError, Result};
use crate::models::Entity;
use crate::services::component::{Component, InitGate};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Models evaluated one after another. Each model sees the previous
/// model's output as `ModelInput::upstream`; the last output is the chain's.
pub struct ModelChain {
    name: String,
    models: Vec<Arc<dyn ModelComponent>>,
    manifest: BTreeSet<String>,
    gate: InitGate,
}

impl ModelChain {
    pub fn new(name: impl Into<String>, models: Vec<Arc<dyn ModelComponent>>) -> Result<Self> {
        if models.is_empty() {
            return Err(PipelineError::Configuration(
                "a model chain needs at least one model".to_string(),
            ));
        }
        let manifest = models
            .iter()
            .flat_map(|model| model.manifest_feature_names().iter().cloned())
            .collect();

        Ok(Self {
            name: name.into(),
            models,
            manifest,
            gate: InitGate::new(),
        })
    }
}

#[async_trait]
impl Component for ModelChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        &self.manifest
    }

    async fn initialize_upstreams(&self) -> Result<()> {
        try_join_all(self.models.iter().map(|model| model.ensure_initialized())).await?;
        Ok(())
    }
}

#[async_trait]
impl ModelComponent for ModelChain {
    async fn batch_inference(
        &self,
        _input: ModelInput<'_>,
        _batch: &[Arc<dyn Entity>],
    ) -> Result<Vec<Option<ModelScore>>> {
        Err(PipelineError::Inference(format!(
            "model chain {} only runs through inference",
            self.name
        )))
    }

    async fn inference(
        &self,
        input: ModelInput<'_>,
        policy: &InferencePolicy,
    ) -> Result<ModelOutput> {
        let mut previous: Option<ModelOutput> = None;
        for model in &self.models {
            let step_input = ModelInput {
                upstream: previous.as_ref(),
                ..input
            };
            let output = model.inference(step_input, policy).await?;
            previous = Some(output);
        }

        let mut output = previous.unwrap_or_else(|| ModelOutput::new(self.name.clone()));
        output.model_name = self.name.clone();
        Ok(output)
    }
}
