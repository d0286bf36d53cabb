/// Business Logic Module
///
/// Post-model score adjustments applied as a strict left-to-right fold.
///
/// # Architecture
/// - **BusinessLogicStage**: one scored-candidate list in, one out
/// - **BoostStage**: additive or multiplicative score change for a key set
/// - **PinStage**: fixed positions for selected keys
/// - **BusinessLogicPipeline**: runs the stages in order, re-sorts after each
///   one and logs a business-logic event for every changed score
/// - **SingleEntityBusinessLogicPipeline**: the same fold over one model
///   output instead of a candidate list
pub mod boost;
pub mod pin;
pub mod single_entity;

pub use boost::{boost, BoostMode, BoostStage};
pub use pin::{pin, PinStage};
pub use single_entity::{SingleEntityBusinessLogicPipeline, SingleEntityInput, SingleEntityStage};

use crate::error::Result;
use crate::models::{sort_by_score_desc, Entity, Identifier, PipelineRequest, ScoredCandidate};
use crate::services::component::{Component, InitGate};
use crate::services::events::EventCollector;
use async_trait::async_trait;
use event_schema::{BusinessLogicEventData, EventData};
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Maps a candidate entity to the key boost and pin configurations refer to
pub type EntityKeyFn = Arc<dyn Fn(&dyn Entity) -> String + Send + Sync>;

/// Key by identifier value
pub fn identifier_key() -> EntityKeyFn {
    Arc::new(|entity: &dyn Entity| entity.identifier().value().to_string())
}

#[async_trait]
pub trait BusinessLogicStage: Component {
    /// Candidates arrive sorted by descending score
    async fn apply(
        &self,
        request: &PipelineRequest,
        candidates: &[ScoredCandidate],
    ) -> Result<Vec<ScoredCandidate>>;
}

/// Events for every candidate whose score differs between `before` and
/// `after`, matched by identifier. A repeated identifier is matched by
/// occurrence: its n-th row in `after` against its n-th row in `before`.
pub fn extract_business_logic_events(
    before: &[ScoredCandidate],
    after: &[ScoredCandidate],
    pipeline_order: usize,
    stage_name: &str,
) -> Vec<EventData> {
    let mut old_scores: HashMap<&Identifier, VecDeque<f64>> = HashMap::new();
    for candidate in before {
        old_scores
            .entry(candidate.identifier())
            .or_default()
            .push_back(candidate.score);
    }

    after
        .iter()
        .filter_map(|candidate| {
            let old_score = old_scores.get_mut(candidate.identifier())?.pop_front()?;
            let unchanged = old_score == candidate.score
                || (old_score.is_nan() && candidate.score.is_nan());
            if unchanged {
                return None;
            }
            Some(EventData::BusinessLogic(BusinessLogicEventData {
                business_logic_pipeline_order: pipeline_order,
                business_logic_name: stage_name.to_string(),
                old_score,
                new_score: candidate.score,
                entity_identifier: candidate.identifier().value().to_string(),
                entity_identifier_type: candidate.identifier().identifier_type().to_string(),
            }))
        })
        .collect()
}

pub struct BusinessLogicPipeline {
    stages: Vec<Arc<dyn BusinessLogicStage>>,
    manifest: BTreeSet<String>,
    gate: InitGate,
}

impl BusinessLogicPipeline {
    pub fn new(stages: Vec<Arc<dyn BusinessLogicStage>>) -> Self {
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

    /// Fold `candidates` through every stage. The result is sorted by
    /// descending score.
    pub async fn execute(
        &self,
        request: &PipelineRequest,
        mut candidates: Vec<ScoredCandidate>,
        events: &EventCollector,
    ) -> Result<Vec<ScoredCandidate>> {
        self.ensure_initialized().await?;
        sort_by_score_desc(&mut candidates);

        for (order, stage) in self.stages.iter().enumerate() {
            let mut next = stage.apply(request, &candidates).await?;
            let changes = extract_business_logic_events(&candidates, &next, order, stage.name());

            debug!(
                stage = %stage.name(),
                order,
                changed = changes.len(),
                "business logic stage applied"
            );
            events.log_all(changes);

            sort_by_score_desc(&mut next);
            candidates = next;
        }

        Ok(candidates)
    }
}

#[async_trait]
impl Component for BusinessLogicPipeline {
    fn name(&self) -> &str {
        "business_logic"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductEntity;
    use event_schema::EventType;

    fn candidate(id: &str, score: f64) -> ScoredCandidate {
        ScoredCandidate::new(Arc::new(ProductEntity::new(id)), score)
    }

    fn order(candidates: &[ScoredCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.identifier().value()).collect()
    }

    #[tokio::test]
    async fn test_stages_fold_in_order_and_log_changes() {
        let pipeline = BusinessLogicPipeline::new(vec![
            Arc::new(BoostStage::new("promo", ["b"], 1.0, BoostMode::Additive)),
            Arc::new(PinStage::new("editorial", [("c", 0)])),
        ]);
        let request = PipelineRequest::new("r", "search");
        let events = EventCollector::new("r", "test");

        let ranked = pipeline
            .execute(
                &request,
                vec![candidate("c", 0.1), candidate("a", 0.9), candidate("b", 0.5)],
                &events,
            )
            .await
            .unwrap();

        assert_eq!(order(&ranked), vec!["c", "b", "a"]);

        let logged = events.snapshot();
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().all(|e| e.event_type == EventType::BusinessLogic));
        match (&logged[0].event_data, &logged[1].event_data) {
            (EventData::BusinessLogic(boosted), EventData::BusinessLogic(pinned)) => {
                assert_eq!(boosted.business_logic_pipeline_order, 0);
                assert_eq!(boosted.business_logic_name, "promo");
                assert_eq!(boosted.entity_identifier, "b");
                assert_eq!(boosted.old_score, 0.5);
                assert_eq!(boosted.new_score, 1.5);
                assert_eq!(pinned.business_logic_pipeline_order, 1);
                assert_eq!(pinned.entity_identifier, "c");
            }
            other => panic!("unexpected payloads {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_only_sorts() {
        let pipeline = BusinessLogicPipeline::new(Vec::new());
        let request = PipelineRequest::new("r", "search");
        let events = EventCollector::new("r", "test");

        let ranked = pipeline
            .execute(&request, vec![candidate("a", 0.1), candidate("b", 0.2)], &events)
            .await
            .unwrap();

        assert_eq!(order(&ranked), vec!["b", "a"]);
        assert!(events.is_empty());
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_unchanged_scores_produce_no_events() {
        let before = vec![candidate("a", 1.0), candidate("b", f64::NAN)];
        let after = vec![candidate("b", f64::NAN), candidate("a", 1.0)];
        assert!(extract_business_logic_events(&before, &after, 0, "noop").is_empty());
    }

    #[test]
    fn test_repeated_identifiers_matched_by_occurrence() {
        let before = vec![candidate("a", 0.9), candidate("a", 0.4)];
        let after = vec![candidate("a", 0.9), candidate("a", 1.4)];

        let changes = extract_business_logic_events(&before, &after, 0, "promo");
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            EventData::BusinessLogic(change) => {
                assert_eq!(change.old_score, 0.4);
                assert_eq!(change.new_score, 1.4);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_initializes_stages() {
        let stage = Arc::new(BoostStage::new("promo", ["b"], 2.0, BoostMode::Multiplicative));
        let pipeline = BusinessLogicPipeline::new(vec![stage.clone()]);
        let request = PipelineRequest::new("r", "search");
        let events = EventCollector::new("r", "test");

        assert!(!stage.init_gate().is_initialized());
        pipeline
            .execute(&request, vec![candidate("b", 1.0)], &events)
            .await
            .unwrap();
        assert!(stage.init_gate().is_initialized());
        assert_eq!(pipeline.len(), 1);
    }
}
