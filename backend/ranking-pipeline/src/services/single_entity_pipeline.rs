// ============================================
// Single-entity pipeline
// ============================================
// Request flow:
// 1. Retrieve store and real-time features for the request's entity graph
// 2. Run the model over the request's context entities
// 3. Keep the output of the first entity the model scored
// 4. Adjust that output with the single-entity business logic
// 5. Hand the event list to the sink

use super::business_logic::{SingleEntityBusinessLogicPipeline, SingleEntityInput, SingleEntityStage};
use super::component::{Component, InitGate};
use super::events::{EventCollector, EventSink};
use super::features::{
    FeatureRetrievalPipeline, FeatureRetrievalRequest, FeatureStoreClient, FeatureStoreRetrieval,
    RealtimeFeatureComponent,
};
use super::pipeline::{publish_events, realtime_registry, resolve_api_source};
use super::ranking::{InferencePolicy, ModelComponent, ModelExecutor, ModelInput, ModelScore};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::models::{Identifier, PipelineRequest};
use async_trait::async_trait;
use event_schema::LoggedEvent;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_PIPELINE_NAME: &str = "single_entity_pipeline";
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct SingleEntityResponse {
    /// Entity the output belongs to
    pub identifier: Identifier,
    pub output: ModelScore,
    /// Present only when the request asked for its events
    pub events: Option<Vec<LoggedEvent>>,
}

/// Scores the request itself rather than a candidate list
pub struct SingleEntityPipeline {
    name: String,
    api_source: String,
    retrieval: FeatureRetrievalPipeline,
    model: ModelExecutor,
    business_logic: SingleEntityBusinessLogicPipeline,
    feature_names: BTreeSet<String>,
    realtime_overrides: BTreeSet<String>,
    handle_feature_exceptions: bool,
    event_sink: Option<Arc<dyn EventSink>>,
    gate: InitGate,
}

impl SingleEntityPipeline {
    pub fn builder() -> SingleEntityPipelineBuilder {
        SingleEntityPipelineBuilder::new()
    }

    pub fn feature_names(&self) -> &BTreeSet<String> {
        &self.feature_names
    }

    pub async fn execute(&self, request: &PipelineRequest) -> Result<SingleEntityResponse> {
        let started = Instant::now();
        self.ensure_initialized().await?;

        let events = EventCollector::new(request.request_id(), resolve_api_source(request, &self.api_source));

        let retrieval = self
            .retrieval
            .retrieve(
                FeatureRetrievalRequest {
                    request,
                    feature_names: &self.feature_names,
                    realtime_overrides: &self.realtime_overrides,
                    handle_exceptions: self.handle_feature_exceptions,
                },
                &events,
            )
            .await?;

        let subjects = request.context_entities();
        let model_output = self
            .model
            .execute(
                ModelInput::new(request, subjects, &retrieval.feature_map),
                &events,
            )
            .await?;

        let (identifier, output) = subjects
            .iter()
            .find_map(|entity| {
                model_output
                    .get(entity.identifier())
                    .map(|score| (entity.identifier().clone(), score.clone()))
            })
            .ok_or_else(|| PipelineError::MissingModelOutput(model_output.model_name.clone()))?;

        let output = self
            .business_logic
            .execute(
                SingleEntityInput {
                    request,
                    identifier: &identifier,
                },
                output,
                &events,
            )
            .await?;

        let logged = events.snapshot();
        publish_events(self.event_sink.as_ref(), &logged);

        info!(
            request_id = %request.request_id(),
            subject = %identifier,
            feature_failures = retrieval.failures.len(),
            events = logged.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "single-entity request completed"
        );

        Ok(SingleEntityResponse {
            identifier,
            output,
            events: request.wants_events().then_some(logged),
        })
    }
}

#[async_trait]
impl Component for SingleEntityPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        &self.feature_names
    }

    async fn initialize_upstreams(&self) -> Result<()> {
        tokio::try_join!(
            self.retrieval.ensure_initialized(),
            self.model.ensure_initialized(),
            self.business_logic.ensure_initialized(),
        )?;
        debug!(pipeline = %self.name, "pipeline upstreams initialized");
        Ok(())
    }
}

pub struct SingleEntityPipelineBuilder {
    name: String,
    api_source: String,
    feature_store: Option<Arc<dyn FeatureStoreClient>>,
    store_timeout: Duration,
    realtime_components: Vec<Arc<dyn RealtimeFeatureComponent>>,
    realtime_overrides: BTreeSet<String>,
    model: Option<Arc<dyn ModelComponent>>,
    inference_policy: InferencePolicy,
    stages: Vec<Arc<dyn SingleEntityStage>>,
    handle_feature_exceptions: bool,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl Default for SingleEntityPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleEntityPipelineBuilder {
    pub fn new() -> Self {
        Self {
            name: DEFAULT_PIPELINE_NAME.to_string(),
            api_source: DEFAULT_PIPELINE_NAME.to_string(),
            feature_store: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            realtime_components: Vec::new(),
            realtime_overrides: BTreeSet::new(),
            model: None,
            inference_policy: InferencePolicy::default(),
            stages: Vec::new(),
            handle_feature_exceptions: false,
            event_sink: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .api_source(config.service_name.clone())
            .store_timeout(config.feature_store_timeout())
            .inference_policy(InferencePolicy {
                batch_size: config.model_batch_size,
                batch_timeout: config.model_timeout(),
                handle_exceptions: config.handle_inference_exceptions,
            })
            .handle_feature_exceptions(config.handle_feature_exceptions)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn api_source(mut self, api_source: impl Into<String>) -> Self {
        self.api_source = api_source.into();
        self
    }

    pub fn feature_store(mut self, store: Arc<dyn FeatureStoreClient>) -> Self {
        self.feature_store = Some(store);
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn realtime_feature(mut self, component: Arc<dyn RealtimeFeatureComponent>) -> Self {
        self.realtime_components.push(component);
        self
    }

    pub fn realtime_override(mut self, component: impl Into<String>) -> Self {
        self.realtime_overrides.insert(component.into());
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelComponent>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn inference_policy(mut self, policy: InferencePolicy) -> Self {
        self.inference_policy = policy;
        self
    }

    pub fn stage(mut self, stage: Arc<dyn SingleEntityStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn handle_feature_exceptions(mut self, handle: bool) -> Self {
        self.handle_feature_exceptions = handle;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<SingleEntityPipeline> {
        let store = self
            .feature_store
            .ok_or_else(|| PipelineError::Configuration("feature store is required".to_string()))?;
        let model = self
            .model
            .ok_or_else(|| PipelineError::Configuration("model is required".to_string()))?;
        if self.inference_policy.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "model batch size must be greater than 0".to_string(),
            ));
        }

        let registry = realtime_registry(self.realtime_components, &self.realtime_overrides)?;
        let business_logic = SingleEntityBusinessLogicPipeline::new(self.stages);
        let model = ModelExecutor::new(model, self.inference_policy);

        let mut feature_names: BTreeSet<String> = model.manifest_feature_names().clone();
        feature_names.extend(business_logic.manifest_feature_names().iter().cloned());
        feature_names.extend(registry.required_feature_names());

        info!(
            pipeline = %self.name,
            features = feature_names.len(),
            stages = business_logic.len(),
            "single-entity pipeline built"
        );

        Ok(SingleEntityPipeline {
            retrieval: FeatureRetrievalPipeline::new(
                format!("{}_features", self.name),
                registry,
                FeatureStoreRetrieval::new(store, self.store_timeout),
            ),
            name: self.name,
            api_source: self.api_source,
            model,
            business_logic,
            feature_names,
            realtime_overrides: self.realtime_overrides,
            handle_feature_exceptions: self.handle_feature_exceptions,
            event_sink: self.event_sink,
            gate: InitGate::new(),
        })
    }
}
