// ============================================
// Ranking pipeline
// ============================================
// Request flow:
// 1. Log candidates in their inbound order
// 2. Retrieve store and real-time features for the request's entity graph
// 3. Score candidates with the model
// 4. Adjust scores with the business-logic stages
// 5. Cut the requested page
// 6. Log impressions and hand the event list to the sink

use super::business_logic::{BusinessLogicPipeline, BusinessLogicStage};
use super::component::{Component, InitGate};
use super::events::{candidate_events, impression_events, EventCollector, EventSink};
use super::features::{
    FeatureRetrievalPipeline, FeatureRetrievalRequest, FeatureStoreClient, FeatureStoreRetrieval,
    HttpFeatureStoreClient, RealtimeFeatureComponent, RealtimeFeatureRegistry,
};
use super::pagination::PaginationComponent;
use super::ranking::{InferencePolicy, ModelComponent, ModelExecutor, ModelInput};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::models::{PipelineRequest, RankedEntity, ScoredCandidate};
use async_trait::async_trait;
use event_schema::LoggedEvent;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_PIPELINE_NAME: &str = "ranking_pipeline";
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct RankingResponse {
    pub ranked_entities: Vec<RankedEntity>,
    /// Present only when the request asked for its events
    pub events: Option<Vec<LoggedEvent>>,
}

pub struct RankingPipeline {
    name: String,
    api_source: String,
    retrieval: FeatureRetrievalPipeline,
    model: ModelExecutor,
    business_logic: BusinessLogicPipeline,
    pagination: PaginationComponent,
    feature_names: BTreeSet<String>,
    realtime_overrides: BTreeSet<String>,
    handle_feature_exceptions: bool,
    event_sink: Option<Arc<dyn EventSink>>,
    gate: InitGate,
}

impl RankingPipeline {
    pub fn builder() -> RankingPipelineBuilder {
        RankingPipelineBuilder::new()
    }

    /// Feature names retrieved for every request
    pub fn feature_names(&self) -> &BTreeSet<String> {
        &self.feature_names
    }

    pub async fn execute(&self, request: &PipelineRequest) -> Result<RankingResponse> {
        let started = Instant::now();
        self.ensure_initialized().await?;

        let events = EventCollector::new(request.request_id(), resolve_api_source(request, &self.api_source));

        let inbound: Vec<ScoredCandidate> = request
            .candidates()
            .iter()
            .enumerate()
            .map(|(index, entity)| ScoredCandidate::new(Arc::clone(entity), index as f64))
            .collect();
        events.log_all(candidate_events(&inbound));

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

        let model_output = self
            .model
            .execute(
                ModelInput::new(request, request.candidates(), &retrieval.feature_map),
                &events,
            )
            .await?;

        let scored: Vec<ScoredCandidate> = request
            .candidates()
            .iter()
            .map(|entity| {
                ScoredCandidate::new(Arc::clone(entity), model_output.score_for(entity.identifier()))
            })
            .collect();

        let ranked = self.business_logic.execute(request, scored, &events).await?;

        let page = match request.pagination() {
            Some(fields) => self.pagination.paginate(fields, &ranked)?,
            None => ranked,
        };
        events.log_all(impression_events(&page));

        let logged = events.snapshot();
        publish_events(self.event_sink.as_ref(), &logged);

        info!(
            request_id = %request.request_id(),
            candidates = request.candidates().len(),
            returned = page.len(),
            feature_failures = retrieval.failures.len(),
            events = logged.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ranking request completed"
        );

        Ok(RankingResponse {
            ranked_entities: page.iter().map(RankedEntity::from).collect(),
            events: request.wants_events().then_some(logged),
        })
    }
}

#[async_trait]
impl Component for RankingPipeline {
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
            self.pagination.ensure_initialized(),
        )?;
        debug!(pipeline = %self.name, "pipeline upstreams initialized");
        Ok(())
    }
}

/// Event source of a request, falling back to the pipeline's own
pub(crate) fn resolve_api_source<'a>(request: &'a PipelineRequest, fallback: &'a str) -> &'a str {
    if request.api_source().is_empty() {
        fallback
    } else {
        request.api_source()
    }
}

/// Hand the request's events to the sink without waiting for delivery
pub(crate) fn publish_events(sink: Option<&Arc<dyn EventSink>>, logged: &[LoggedEvent]) {
    if let Some(sink) = sink {
        let sink = Arc::clone(sink);
        let batch = logged.to_vec();
        tokio::spawn(async move { sink.publish(batch).await });
    }
}

/// Register components in order and check that every override names one
pub(crate) fn realtime_registry(
    components: Vec<Arc<dyn RealtimeFeatureComponent>>,
    overrides: &BTreeSet<String>,
) -> Result<RealtimeFeatureRegistry> {
    let mut registry = RealtimeFeatureRegistry::new();
    for component in components {
        registry.register(component)?;
    }
    if let Some(unknown) = overrides.iter().find(|name| registry.get(name).is_none()) {
        return Err(PipelineError::Configuration(format!(
            "real-time override names unknown component '{}'",
            unknown
        )));
    }
    Ok(registry)
}

/// Collaborators are injected here; nothing is looked up globally
pub struct RankingPipelineBuilder {
    name: String,
    api_source: String,
    feature_store: Option<Arc<dyn FeatureStoreClient>>,
    store_timeout: Duration,
    realtime_components: Vec<Arc<dyn RealtimeFeatureComponent>>,
    realtime_overrides: BTreeSet<String>,
    model: Option<Arc<dyn ModelComponent>>,
    inference_policy: InferencePolicy,
    stages: Vec<Arc<dyn BusinessLogicStage>>,
    handle_feature_exceptions: bool,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl Default for RankingPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RankingPipelineBuilder {
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

    /// Timeouts, batch size, isolation flags and api source from `config`
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

    /// Event source used when the request does not name one
    pub fn api_source(mut self, api_source: impl Into<String>) -> Self {
        self.api_source = api_source.into();
        self
    }

    pub fn feature_store(mut self, store: Arc<dyn FeatureStoreClient>) -> Self {
        self.feature_store = Some(store);
        self
    }

    /// Use the HTTP online store described by `config`
    pub fn http_feature_store(self, config: &Config) -> Result<Self> {
        let client = HttpFeatureStoreClient::from_config(config)?;
        Ok(self.feature_store(Arc::new(client)))
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn realtime_feature(mut self, component: Arc<dyn RealtimeFeatureComponent>) -> Self {
        self.realtime_components.push(component);
        self
    }

    /// Treat every `<component>:*` feature as real-time and always run the
    /// component
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

    pub fn stage(mut self, stage: Arc<dyn BusinessLogicStage>) -> Self {
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

    pub fn build(self) -> Result<RankingPipeline> {
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

        let business_logic = BusinessLogicPipeline::new(self.stages);
        let model = ModelExecutor::new(model, self.inference_policy);

        let mut feature_names: BTreeSet<String> = model.manifest_feature_names().clone();
        feature_names.extend(business_logic.manifest_feature_names().iter().cloned());
        feature_names.extend(registry.required_feature_names());

        info!(
            pipeline = %self.name,
            features = feature_names.len(),
            realtime_components = registry.len(),
            stages = business_logic.len(),
            "ranking pipeline built"
        );

        Ok(RankingPipeline {
            retrieval: FeatureRetrievalPipeline::new(
                format!("{}_features", self.name),
                registry,
                FeatureStoreRetrieval::new(store, self.store_timeout),
            ),
            name: self.name,
            api_source: self.api_source,
            model,
            business_logic,
            pagination: PaginationComponent::new(),
            feature_names,
            realtime_overrides: self.realtime_overrides,
            handle_feature_exceptions: self.handle_feature_exceptions,
            event_sink: self.event_sink,
            gate: InitGate::new(),
        })
    }
}
