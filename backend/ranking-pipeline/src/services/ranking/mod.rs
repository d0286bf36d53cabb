/// Ranking Module
///
/// Runs model inference over the candidates of a request.
///
/// # Architecture
/// - **ModelComponent**: a model scores one batch of entities at a time
/// - **Batching**: entities are split into fixed-size batches that run
///   concurrently and are stitched back together by identifier
/// - **ModelExecutor**: applies the inference policy (batch size, timeout,
///   isolation) and logs one model event per entity
///
/// # Workflow
/// 1. Read the request's merged FeatureMap
/// 2. Partition candidates into batches
/// 3. Score every batch concurrently
/// 4. Map identifier -> output
pub mod chain;
pub mod linear;
pub mod remote;

pub use chain::ModelChain;
pub use linear::LinearModel;
pub use remote::{InferenceBackend, RemoteModelComponent};

use crate::error::{PipelineError, Result};
use crate::models::{Entity, FeatureMap, Identifier, PipelineRequest};
use crate::services::component::{Component, InitGate};
use crate::services::events::EventCollector;
use crate::utils::with_deadline;
use async_trait::async_trait;
use event_schema::{EventData, ModelEventData};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of entities per inference batch
pub const DEFAULT_MODEL_BATCH_SIZE: usize = 30;

/// Default timeout of one inference batch
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Output of a model for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelScore {
    Float(f64),
    Text(String),
    FloatList(Vec<f64>),
}

impl ModelScore {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ModelScore::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Decode a backend output; `null` and unsupported shapes mean the
    /// model declined to score
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(ModelScore::Float),
            serde_json::Value::String(s) => Some(ModelScore::Text(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| item.as_f64())
                .collect::<Option<Vec<f64>>>()
                .map(ModelScore::FloatList),
            _ => None,
        }
    }
}

impl fmt::Display for ModelScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelScore::Float(v) => write!(f, "{}", v),
            ModelScore::Text(s) => f.write_str(s),
            ModelScore::FloatList(values) => {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

impl From<f64> for ModelScore {
    fn from(v: f64) -> Self {
        ModelScore::Float(v)
    }
}

/// Identifier -> output. `None` means the model declined to score.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub model_name: String,
    pub data: HashMap<Identifier, Option<ModelScore>>,
}

impl ModelOutput {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            data: HashMap::new(),
        }
    }

    pub fn get(&self, identifier: &Identifier) -> Option<&ModelScore> {
        self.data.get(identifier).and_then(|score| score.as_ref())
    }

    /// Ranking score of an entity: its float output, 0.0 otherwise
    pub fn score_for(&self, identifier: &Identifier) -> f64 {
        self.get(identifier)
            .and_then(ModelScore::as_f64)
            .unwrap_or(0.0)
    }
}

/// What a model sees for one inference call
#[derive(Debug, Clone, Copy)]
pub struct ModelInput<'a> {
    pub request: &'a PipelineRequest,
    pub entities: &'a [Arc<dyn Entity>],
    pub features: &'a FeatureMap,
    /// Output of the previous model in a chain
    pub upstream: Option<&'a ModelOutput>,
}

impl<'a> ModelInput<'a> {
    pub fn new(
        request: &'a PipelineRequest,
        entities: &'a [Arc<dyn Entity>],
        features: &'a FeatureMap,
    ) -> Self {
        Self {
            request,
            entities,
            features,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InferencePolicy {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Leave a failed batch unscored instead of failing the call
    pub handle_exceptions: bool,
}

impl Default for InferencePolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MODEL_BATCH_SIZE,
            batch_timeout: DEFAULT_MODEL_TIMEOUT,
            handle_exceptions: false,
        }
    }
}

#[async_trait]
pub trait ModelComponent: Component {
    /// Outputs aligned by position with `batch`
    async fn batch_inference(
        &self,
        input: ModelInput<'_>,
        batch: &[Arc<dyn Entity>],
    ) -> Result<Vec<Option<ModelScore>>>;

    async fn inference(
        &self,
        input: ModelInput<'_>,
        policy: &InferencePolicy,
    ) -> Result<ModelOutput> {
        batched_inference(self, input, policy).await
    }
}

/// Split `input.entities` into batches, score them concurrently and key the
/// outputs by identifier. A batch whose output length differs from its
/// input length fails.
pub async fn batched_inference<M>(
    model: &M,
    input: ModelInput<'_>,
    policy: &InferencePolicy,
) -> Result<ModelOutput>
where
    M: ModelComponent + ?Sized,
{
    let mut output = ModelOutput::new(model.name());
    if input.entities.is_empty() {
        return Ok(output);
    }

    let batches: Vec<&[Arc<dyn Entity>]> = input.entities.chunks(policy.batch_size.max(1)).collect();
    debug!(model = %model.name(), batches = batches.len(), "running batched inference");

    let outcomes = join_all(batches.iter().map(|batch| async move {
        let scores = with_deadline(
            policy.batch_timeout,
            "model batch inference",
            model.batch_inference(input, batch),
        )
        .await?;

        if scores.len() != batch.len() {
            return Err(PipelineError::BatchLengthMismatch {
                model: model.name().to_string(),
                expected: batch.len(),
                actual: scores.len(),
            });
        }
        Ok(scores)
    }))
    .await;

    for (batch, outcome) in batches.iter().zip(outcomes) {
        match outcome {
            Ok(scores) => {
                for (entity, score) in batch.iter().zip(scores) {
                    output.data.insert(entity.identifier().clone(), score);
                }
            }
            Err(e) if policy.handle_exceptions && e.is_isolatable() => {
                warn!(
                    model = %model.name(),
                    batch_len = batch.len(),
                    error = %e,
                    "inference batch failed, leaving entities unscored"
                );
                for entity in batch.iter() {
                    output.data.insert(entity.identifier().clone(), None);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(output)
}

/// Model stage of a ranking pipeline
pub struct ModelExecutor {
    model: Arc<dyn ModelComponent>,
    policy: InferencePolicy,
    gate: InitGate,
}

impl ModelExecutor {
    pub fn new(model: Arc<dyn ModelComponent>, policy: InferencePolicy) -> Self {
        Self {
            model,
            policy,
            gate: InitGate::new(),
        }
    }

    pub fn policy(&self) -> &InferencePolicy {
        &self.policy
    }

    /// Run inference and log one model event per scored entity
    pub async fn execute(
        &self,
        input: ModelInput<'_>,
        events: &EventCollector,
    ) -> Result<ModelOutput> {
        self.ensure_initialized().await?;
        let output = self.model.inference(input, &self.policy).await?;

        events.log_all(input.entities.iter().map(|entity| {
            let identifier = entity.identifier();
            let rendered = match output.get(identifier) {
                Some(score) => score.to_string(),
                None => "null".to_string(),
            };
            EventData::Model(ModelEventData {
                model_name: output.model_name.clone(),
                model_output: rendered,
                entity_identifier: Some(identifier.value().to_string()),
                entity_identifier_type: Some(identifier.identifier_type().to_string()),
            })
        }));

        Ok(output)
    }
}

#[async_trait]
impl Component for ModelExecutor {
    fn name(&self) -> &str {
        self.model.name()
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        self.model.manifest_feature_names()
    }

    async fn initialize_upstreams(&self) -> Result<()> {
        self.model.ensure_initialized().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns preset scores per entity id, optionally with a per-batch
    /// delay that makes later batches finish first
    pub struct ScriptedModel {
        gate: InitGate,
        scores: HashMap<String, f64>,
        pub batches_seen: Mutex<Vec<Vec<String>>>,
        pub short_by_one: bool,
        pub fail_batch_containing: Option<String>,
        /// Fail every batch with a configuration error
        pub misconfigured: bool,
        pub initializations: AtomicUsize,
    }

    impl ScriptedModel {
        pub fn new(scores: &[(&str, f64)]) -> Self {
            Self {
                gate: InitGate::new(),
                scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                batches_seen: Mutex::new(Vec::new()),
                short_by_one: false,
                fail_batch_containing: None,
                misconfigured: false,
                initializations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Component for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn init_gate(&self) -> &InitGate {
            &self.gate
        }

        async fn initialize(&self) -> Result<()> {
            self.initializations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ModelComponent for ScriptedModel {
        async fn batch_inference(
            &self,
            _input: ModelInput<'_>,
            batch: &[Arc<dyn Entity>],
        ) -> Result<Vec<Option<ModelScore>>> {
            let ids: Vec<String> = batch
                .iter()
                .map(|e| e.identifier().value().to_string())
                .collect();
            self.batches_seen.lock().unwrap().push(ids.clone());

            if self.misconfigured {
                return Err(PipelineError::Configuration("model endpoint not set".into()));
            }

            if let Some(bad) = &self.fail_batch_containing {
                if ids.contains(bad) {
                    return Err(PipelineError::Inference(format!("backend rejected {}", bad)));
                }
            }

            // earlier batches sleep longer so completion order is reversed
            let delay = 5 * (10 - self.batches_seen.lock().unwrap().len().min(10)) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;

            let mut scores: Vec<Option<ModelScore>> = ids
                .iter()
                .map(|id| self.scores.get(id).copied().map(ModelScore::Float))
                .collect();
            if self.short_by_one {
                scores.pop();
            }
            Ok(scores)
        }
    }
}
