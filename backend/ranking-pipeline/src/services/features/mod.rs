// ============================================
// Feature Retrieval Module
// ============================================
// Classifies requested feature names, fetches store features and computes
// real-time features concurrently, then merges everything into one
// FeatureMap for the request.

pub mod classifier;
pub mod http_client;
pub mod merge;
pub mod realtime;
pub mod store;

pub use classifier::{classify, FeatureClassification};
pub use http_client::HttpFeatureStoreClient;
pub use merge::{merge_feature_maps, RealtimeResult};
pub use realtime::{
    FeatureFamily, PrefixFamily, RealtimeFeatureComponent, RealtimeFeatureDescriptor,
    RealtimeFeatureRegistry, RealtimeFeatureRequest,
};
pub use store::{FeatureStoreClient, FeatureStoreRetrieval, InMemoryFeatureStore};

use crate::error::Result;
use crate::models::{Entity, FeatureMap, Identifier, PipelineRequest};
use crate::services::component::{Component, InitGate};
use crate::services::events::EventCollector;
use async_trait::async_trait;
use event_schema::{EventData, FeatureEventData};
use futures::future::{join_all, try_join_all};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inputs of one retrieval call
#[derive(Debug, Clone, Copy)]
pub struct FeatureRetrievalRequest<'a> {
    pub request: &'a PipelineRequest,
    pub feature_names: &'a BTreeSet<String>,
    /// Components whose whole `<name>:*` namespace is treated as real-time
    pub realtime_overrides: &'a BTreeSet<String>,
    /// Swallow fetch failures as absent values instead of failing the call
    pub handle_exceptions: bool,
}

/// A real-time execution that failed and was isolated
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalFailure {
    pub component: String,
    pub identifier: Option<Identifier>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct FeatureRetrievalResponse {
    pub feature_map: FeatureMap,
    pub classification: FeatureClassification,
    pub failures: Vec<RetrievalFailure>,
}

/// One scheduled (component, primary, secondary) execution
struct Invocation {
    position: usize,
    component: Arc<dyn RealtimeFeatureComponent>,
    primary: Option<Arc<dyn Entity>>,
    secondary: Option<Arc<dyn Entity>>,
}

impl Invocation {
    fn subject(&self) -> Option<Identifier> {
        match (&self.primary, &self.secondary) {
            (Some(p), Some(s)) => Identifier::composite(p.identifier(), s.identifier()).ok(),
            (Some(p), None) => Some(p.identifier().clone()),
            _ => None,
        }
    }
}

type WaveOutcome = (Vec<RealtimeResult>, Vec<RetrievalFailure>);

pub struct FeatureRetrievalPipeline {
    name: String,
    registry: RealtimeFeatureRegistry,
    store: FeatureStoreRetrieval,
    gate: InitGate,
}

impl FeatureRetrievalPipeline {
    pub fn new(
        name: impl Into<String>,
        registry: RealtimeFeatureRegistry,
        store: FeatureStoreRetrieval,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            store,
            gate: InitGate::new(),
        }
    }

    pub fn registry(&self) -> &RealtimeFeatureRegistry {
        &self.registry
    }

    pub async fn retrieve(
        &self,
        input: FeatureRetrievalRequest<'_>,
        events: &EventCollector,
    ) -> Result<FeatureRetrievalResponse> {
        self.ensure_initialized().await?;

        let request = input.request;
        let classification = classify(input.feature_names, &self.registry, input.realtime_overrides);

        let active: Vec<(usize, Arc<dyn RealtimeFeatureComponent>)> = self
            .registry
            .components()
            .iter()
            .enumerate()
            .filter(|(_, component)| {
                let name = component.descriptor().name();
                classification.realtime_feature_names.contains_key(name)
                    || input.realtime_overrides.contains(name)
            })
            .map(|(position, component)| (position, Arc::clone(component)))
            .collect();

        let (early, late): (Vec<Invocation>, Vec<Invocation>) = plan_invocations(request, &active)
            .into_iter()
            .partition(|invocation| !invocation.component.descriptor().depends_on_store());

        debug!(
            request_id = %request.request_id(),
            store_features = classification.store_feature_names.len(),
            realtime_components = active.len(),
            invocations = early.len() + late.len(),
            "retrieving features"
        );

        let identifiers = request.all_identifiers();
        let no_store_features = FeatureMap::new();
        let early_input = RealtimeFeatureRequest {
            request,
            store_features: &no_store_features,
        };

        let (store_map, (mut results, mut failures)) = tokio::try_join!(
            self.store.fetch(
                identifiers,
                &classification.store_feature_names,
                input.handle_exceptions
            ),
            run_wave(&early, 0, early_input, input.handle_exceptions, events),
        )?;

        if !late.is_empty() {
            let late_input = RealtimeFeatureRequest {
                request,
                store_features: &store_map,
            };
            let (late_results, late_failures) =
                run_wave(&late, early.len(), late_input, input.handle_exceptions, events).await?;
            results.extend(late_results);
            failures.extend(late_failures);
        }

        let requested = classification.all_feature_names();
        let feature_map = merge_feature_maps(
            store_map,
            results,
            request.feature_overrides(),
            identifiers,
            &requested,
        );

        Ok(FeatureRetrievalResponse {
            feature_map,
            classification,
            failures,
        })
    }
}

#[async_trait]
impl Component for FeatureRetrievalPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    async fn initialize_upstreams(&self) -> Result<()> {
        try_join_all(
            self.registry
                .components()
                .iter()
                .map(|component| component.ensure_initialized()),
        )
        .await?;
        Ok(())
    }
}

/// Every applicable (component, entity pairing) for a request. Pairings:
/// request only, each context entity, ordered pairs of distinct context
/// entities, each candidate entity, and each candidate x context entity.
fn plan_invocations(
    request: &PipelineRequest,
    components: &[(usize, Arc<dyn RealtimeFeatureComponent>)],
) -> Vec<Invocation> {
    type Pairing = (Option<Arc<dyn Entity>>, Option<Arc<dyn Entity>>);

    let context = request.context_entities();
    let candidates = request.candidate_entities();

    let mut pairings: Vec<Pairing> = vec![(None, None)];
    pairings.extend(context.iter().map(|e| (Some(Arc::clone(e)), None)));
    for primary in context {
        for secondary in context {
            if primary.identifier() != secondary.identifier() {
                pairings.push((Some(Arc::clone(primary)), Some(Arc::clone(secondary))));
            }
        }
    }
    pairings.extend(candidates.iter().map(|e| (Some(Arc::clone(e)), None)));
    for primary in candidates {
        for secondary in context {
            pairings.push((Some(Arc::clone(primary)), Some(Arc::clone(secondary))));
        }
    }

    let mut invocations = Vec::new();
    for (position, component) in components {
        for (primary, secondary) in &pairings {
            if component.can_execute_on(request, primary.as_deref(), secondary.as_deref()) {
                invocations.push(Invocation {
                    position: *position,
                    component: Arc::clone(component),
                    primary: primary.clone(),
                    secondary: secondary.clone(),
                });
            }
        }
    }
    invocations
}

/// Run every invocation concurrently. Without `handle_exceptions` the first
/// failure fails the wave; with it, isolatable failures are logged and
/// reported and anything else still fails the wave.
async fn run_wave(
    invocations: &[Invocation],
    sequence_offset: usize,
    input: RealtimeFeatureRequest<'_>,
    handle_exceptions: bool,
    events: &EventCollector,
) -> Result<WaveOutcome> {
    if invocations.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let executions = invocations
        .iter()
        .enumerate()
        .map(|(index, invocation)| execute_invocation(invocation, sequence_offset + index, input, events));

    if !handle_exceptions {
        let results = try_join_all(executions).await?;
        return Ok((results.into_iter().flatten().collect(), Vec::new()));
    }

    let mut results = Vec::new();
    let mut failures = Vec::new();
    for (invocation, outcome) in invocations.iter().zip(join_all(executions).await) {
        match outcome {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) if e.is_isolatable() => {
                let identifier = invocation.subject();
                warn!(
                    component = %invocation.component.descriptor().name(),
                    identifier = ?identifier.as_ref().map(|id| id.to_string()),
                    error = %e,
                    "real-time feature failed, continuing without it"
                );
                failures.push(RetrievalFailure {
                    component: invocation.component.descriptor().name().to_string(),
                    identifier,
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok((results, failures))
}

async fn execute_invocation(
    invocation: &Invocation,
    sequence: usize,
    input: RealtimeFeatureRequest<'_>,
    events: &EventCollector,
) -> Result<Option<RealtimeResult>> {
    let computed = invocation
        .component
        .execute(
            input,
            invocation.primary.as_deref(),
            invocation.secondary.as_deref(),
        )
        .await?;

    Ok(computed.map(|data| {
        events.log_all(data.features.iter().map(|(name, value)| {
            EventData::Feature(FeatureEventData {
                feature_identifier: data.identifier.value().to_string(),
                feature_identifier_type: data.identifier.identifier_type().to_string(),
                feature_name: name.clone(),
                feature_value: value.to_json(),
            })
        }));
        RealtimeResult {
            component_position: invocation.position,
            sequence,
            data,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::realtime::testing::StaticFeature;
    use super::*;
    use crate::error::PipelineError;
    use crate::models::{
        FeatureValue, ProductEntity, QueryEntity, SimpleIdentifierType, UserEntity,
    };
    use event_schema::EventType;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn request() -> PipelineRequest {
        PipelineRequest::new("req-1", "product_search")
            .with_context(Arc::new(QueryEntity::new("shoes")))
            .with_context(Arc::new(UserEntity::new("u1")))
            .with_candidates(vec![
                Arc::new(ProductEntity::new("p1")),
                Arc::new(ProductEntity::new("p2")),
                Arc::new(ProductEntity::new("p3")),
            ])
    }

    fn product_id(id: &str) -> Identifier {
        Identifier::new(id, SimpleIdentifierType::Product)
    }

    fn names(raw: &[&str]) -> BTreeSet<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn pipeline(
        components: Vec<Arc<dyn RealtimeFeatureComponent>>,
        store: Arc<dyn FeatureStoreClient>,
    ) -> FeatureRetrievalPipeline {
        let mut registry = RealtimeFeatureRegistry::new();
        for component in components {
            registry.register(component).unwrap();
        }
        FeatureRetrievalPipeline::new(
            "retrieval",
            registry,
            FeatureStoreRetrieval::new(store, Duration::from_secs(1)),
        )
    }

    fn retrieval_input<'a>(
        request: &'a PipelineRequest,
        feature_names: &'a BTreeSet<String>,
        overrides: &'a BTreeSet<String>,
        handle_exceptions: bool,
    ) -> FeatureRetrievalRequest<'a> {
        FeatureRetrievalRequest {
            request,
            feature_names,
            realtime_overrides: overrides,
            handle_exceptions,
        }
    }

    #[tokio::test]
    async fn test_fans_out_over_candidates_and_pairs() {
        let single = Arc::new(StaticFeature::new(
            RealtimeFeatureDescriptor::new("rt")
                .primary(SimpleIdentifierType::Product)
                .outputs(["f1"]),
            2.0,
        ));
        let paired = Arc::new(StaticFeature::new(
            RealtimeFeatureDescriptor::new("pq")
                .primary(SimpleIdentifierType::Product)
                .secondary(SimpleIdentifierType::Query)
                .outputs(["match"]),
            1.0,
        ));
        let store = InMemoryFeatureStore::new().with_feature(&product_id("p1"), "fv:f1", 1.0);
        let retrieval = pipeline(vec![single.clone(), paired.clone()], Arc::new(store));

        let request = request();
        let requested = names(&["fv:f1", "rt:f1", "pq:match"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");

        let response = retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
            .await
            .unwrap();

        assert_eq!(single.calls.load(Ordering::SeqCst), 3);
        assert_eq!(paired.calls.load(Ordering::SeqCst), 3);

        let map = &response.feature_map;
        let p1 = product_id("p1");
        assert_eq!(map.feature(&p1, "fv:f1"), Some(&FeatureValue::Float(1.0)));
        assert_eq!(map.feature(&p1, "rt:f1"), Some(&FeatureValue::Float(2.0)));

        let query = Identifier::new("shoes", SimpleIdentifierType::Query);
        let pair = Identifier::composite(&p1, &query).unwrap();
        assert_eq!(map.feature(&pair, "pq:match"), Some(&FeatureValue::Float(1.0)));

        // every identifier of the request graph has an entry
        for identifier in request.all_identifiers() {
            assert!(map.contains(identifier), "missing {}", identifier);
        }

        let feature_events = events
            .snapshot()
            .iter()
            .filter(|e| e.event_type == EventType::Feature)
            .count();
        assert_eq!(feature_events, 6);
    }

    #[tokio::test]
    async fn test_unrequested_components_do_not_run() {
        let idle = Arc::new(StaticFeature::new(
            RealtimeFeatureDescriptor::new("idle")
                .primary(SimpleIdentifierType::Product)
                .outputs(["f1"]),
            1.0,
        ));
        let retrieval = pipeline(vec![idle.clone()], Arc::new(InMemoryFeatureStore::new()));

        let request = request();
        let requested = names(&["fv:f1"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");

        retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
            .await
            .unwrap();
        assert_eq!(idle.calls.load(Ordering::SeqCst), 0);

        let overrides = names(&["idle"]);
        retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
            .await
            .unwrap();
        assert_eq!(idle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_realtime_failure_isolated_per_entity() {
        let flaky = Arc::new(
            StaticFeature::new(
                RealtimeFeatureDescriptor::new("rt")
                    .primary(SimpleIdentifierType::Product)
                    .outputs(["f1"]),
                5.0,
            )
            .failing_on("p2"),
        );
        let retrieval = pipeline(vec![flaky], Arc::new(InMemoryFeatureStore::new()));

        let request = request();
        let requested = names(&["rt:f1"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");

        let response = retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, true), &events)
            .await
            .unwrap();

        let map = &response.feature_map;
        assert_eq!(map.feature(&product_id("p1"), "rt:f1"), Some(&FeatureValue::Float(5.0)));
        assert_eq!(map.feature(&product_id("p2"), "rt:f1"), Some(&FeatureValue::Absent));
        assert_eq!(map.feature(&product_id("p3"), "rt:f1"), Some(&FeatureValue::Float(5.0)));
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].component, "rt");
        assert_eq!(response.failures[0].identifier, Some(product_id("p2")));

        let err = retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RealtimeFeature { .. }));
    }

    #[tokio::test]
    async fn test_configuration_errors_are_not_isolated() {
        let misconfigured = Arc::new(
            StaticFeature::new(
                RealtimeFeatureDescriptor::new("rt")
                    .primary(SimpleIdentifierType::Product)
                    .outputs(["f1"]),
                5.0,
            )
            .misconfigured_on("p1"),
        );
        let retrieval = pipeline(vec![misconfigured], Arc::new(InMemoryFeatureStore::new()));

        let request = request();
        let requested = names(&["rt:f1"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");

        let err = retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, true), &events)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_retrieve_initializes_components_on_first_call() {
        let rt = Arc::new(StaticFeature::new(
            RealtimeFeatureDescriptor::new("rt")
                .primary(SimpleIdentifierType::Product)
                .outputs(["f1"]),
            1.0,
        ));
        let retrieval = pipeline(vec![rt.clone()], Arc::new(InMemoryFeatureStore::new()));

        let request = request();
        let requested = names(&["rt:f1"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");

        for _ in 0..2 {
            retrieval
                .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
                .await
                .unwrap();
        }

        assert_eq!(rt.initializations.load(Ordering::SeqCst), 1);
        assert_eq!(rt.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_store_dependent_component_sees_store_features() {
        struct Doubler {
            descriptor: RealtimeFeatureDescriptor,
            gate: InitGate,
        }

        #[async_trait]
        impl Component for Doubler {
            fn name(&self) -> &str {
                self.descriptor.name()
            }

            fn init_gate(&self) -> &InitGate {
                &self.gate
            }
        }

        #[async_trait]
        impl RealtimeFeatureComponent for Doubler {
            fn descriptor(&self) -> &RealtimeFeatureDescriptor {
                &self.descriptor
            }

            async fn compute_features(
                &self,
                entity: &dyn Entity,
                input: RealtimeFeatureRequest<'_>,
            ) -> Result<Option<crate::models::FeatureData>> {
                let Some(price) = input
                    .store_features
                    .feature(entity.identifier(), "fv:price")
                    .and_then(|v| v.as_f64())
                else {
                    return Ok(None);
                };
                Ok(Some(
                    crate::models::FeatureData::new(entity.identifier().clone())
                        .with_feature("double_price", price * 2.0),
                ))
            }
        }

        let doubler = Arc::new(Doubler {
            descriptor: RealtimeFeatureDescriptor::new("derived")
                .primary(SimpleIdentifierType::Product)
                .outputs(["double_price"])
                .requires(["fv:price"]),
            gate: InitGate::new(),
        });
        let store = InMemoryFeatureStore::new().with_feature(&product_id("p1"), "fv:price", 21.0);
        let retrieval = pipeline(vec![doubler], Arc::new(store));

        let request = request();
        let requested = names(&["fv:price", "derived:double_price"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");

        let response = retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
            .await
            .unwrap();

        let map = &response.feature_map;
        assert_eq!(
            map.feature(&product_id("p1"), "derived:double_price"),
            Some(&FeatureValue::Float(42.0))
        );
        assert_eq!(
            map.feature(&product_id("p2"), "derived:double_price"),
            Some(&FeatureValue::Absent)
        );
    }

    #[tokio::test]
    async fn test_overrides_win_over_store_and_realtime() {
        let rt = Arc::new(StaticFeature::new(
            RealtimeFeatureDescriptor::new("rt")
                .primary(SimpleIdentifierType::Product)
                .outputs(["f1"]),
            2.0,
        ));
        let p1 = product_id("p1");
        let store = InMemoryFeatureStore::new().with_feature(&p1, "fv:f1", 1.0);
        let retrieval = pipeline(vec![rt], Arc::new(store));

        let mut overrides_map = FeatureMap::new();
        overrides_map.set(&p1, "fv:f1", FeatureValue::Float(9.0));
        overrides_map.set(&p1, "rt:f1", FeatureValue::Float(8.0));
        let request = request().with_feature_overrides(overrides_map);

        let requested = names(&["fv:f1", "rt:f1"]);
        let overrides = BTreeSet::new();
        let events = EventCollector::new("req-1", "test");
        let response = retrieval
            .retrieve(retrieval_input(&request, &requested, &overrides, false), &events)
            .await
            .unwrap();

        let map = &response.feature_map;
        assert_eq!(map.feature(&p1, "fv:f1"), Some(&FeatureValue::Float(9.0)));
        assert_eq!(map.feature(&p1, "rt:f1"), Some(&FeatureValue::Float(8.0)));
        assert_eq!(
            map.feature(&product_id("p2"), "rt:f1"),
            Some(&FeatureValue::Float(2.0))
        );
    }

    #[tokio::test]
    async fn test_initializes_registered_components() {
        let rt = Arc::new(StaticFeature::new(
            RealtimeFeatureDescriptor::new("rt").primary(SimpleIdentifierType::Product),
            1.0,
        ));
        let retrieval = pipeline(vec![rt.clone()], Arc::new(InMemoryFeatureStore::new()));

        retrieval.ensure_initialized().await.unwrap();
        assert!(rt.init_gate().is_initialized());
    }
}
