use crate::error::Result;
use crate::models::{Identifier, PipelineRequest};
use crate::services::component::{Component, InitGate};
use crate::services::events::EventCollector;
use crate::services::ranking::ModelScore;
use async_trait::async_trait;
use event_schema::{BusinessLogicEventData, EventData};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// What a single-entity stage sees besides the current output
#[derive(Debug, Clone, Copy)]
pub struct SingleEntityInput<'a> {
    pub request: &'a PipelineRequest,
    /// Entity the model output belongs to
    pub identifier: &'a Identifier,
}

#[async_trait]
pub trait SingleEntityStage: Component {
    async fn adjust(&self, input: SingleEntityInput<'_>, output: ModelScore) -> Result<ModelScore>;
}

/// Folds one model output through every stage in order. A stage that
/// changes a float output logs a business-logic event.
pub struct SingleEntityBusinessLogicPipeline {
    stages: Vec<Arc<dyn SingleEntityStage>>,
    manifest: BTreeSet<String>,
    gate: InitGate,
}

impl SingleEntityBusinessLogicPipeline {
    pub fn new(stages: Vec<Arc<dyn SingleEntityStage>>) -> Self {
        let manifest = stages
            .iter()
            .flat_map(|stage| stage.manifest_feature_names().iter().cloned())
            .collect();
        Self {
            stages,
            manifest,
            gate: InitGate::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn execute(
        &self,
        input: SingleEntityInput<'_>,
        output: ModelScore,
        events: &EventCollector,
    ) -> Result<ModelScore> {
        self.ensure_initialized().await?;

        let mut current = output;
        for (order, stage) in self.stages.iter().enumerate() {
            let adjusted = stage.adjust(input, current.clone()).await?;

            if let (Some(old_score), Some(new_score)) = (current.as_f64(), adjusted.as_f64()) {
                let unchanged = old_score == new_score || (old_score.is_nan() && new_score.is_nan());
                if !unchanged {
                    events.log(EventData::BusinessLogic(BusinessLogicEventData {
                        business_logic_pipeline_order: order,
                        business_logic_name: stage.name().to_string(),
                        old_score,
                        new_score,
                        entity_identifier: input.identifier.value().to_string(),
                        entity_identifier_type: input.identifier.identifier_type().to_string(),
                    }));
                }
            }

            debug!(stage = %stage.name(), order, "single-entity stage applied");
            current = adjusted;
        }

        Ok(current)
    }
}

impl Default for SingleEntityBusinessLogicPipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Component for SingleEntityBusinessLogicPipeline {
    fn name(&self) -> &str {
        "single_entity_business_logic"
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        &self.manifest
    }

    async fn initialize_upstreams(&self) -> Result<()> {
        try_join_all(self.stages.iter().map(|stage| stage.ensure_initialized())).await?;
        Ok(())
    }
}
