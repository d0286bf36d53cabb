use super::entity::{collect_entity_graph, Entity};
use super::feature::FeatureMap;
use super::identifier::{Identifier, SimpleIdentifierType};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Paging parameters supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PaginationFields {
    pub user_page_size: i64,
    pub user_page: i64,
    pub candidate_page_size: i64,
    pub candidate_page: i64,
}

/// Entity graph of a request, computed once
#[derive(Debug, Clone)]
struct RequestGraph {
    context: Vec<Arc<dyn Entity>>,
    candidates: Vec<Arc<dyn Entity>>,
    identifiers: Vec<Identifier>,
}

/// One inbound ranking request
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    request_id: String,
    identifier: Identifier,
    /// Request kind matched by component descriptors (e.g. "product_search")
    kind: String,
    api_source: String,
    context: Vec<Arc<dyn Entity>>,
    candidates: Vec<Arc<dyn Entity>>,
    include_events: bool,
    pagination: Option<PaginationFields>,
    feature_overrides: Option<FeatureMap>,
    graph: OnceCell<RequestGraph>,
}

impl PipelineRequest {
    pub fn new(request_id: impl Into<String>, kind: impl Into<String>) -> Self {
        let request_id = request_id.into();
        Self {
            identifier: Identifier::new(request_id.clone(), SimpleIdentifierType::Request),
            request_id,
            kind: kind.into(),
            api_source: String::new(),
            context: Vec::new(),
            candidates: Vec::new(),
            include_events: false,
            pagination: None,
            feature_overrides: None,
            graph: OnceCell::new(),
        }
    }

    /// Add a request-level entity (query, user, ...)
    pub fn with_context(mut self, entity: Arc<dyn Entity>) -> Self {
        self.context.push(entity);
        self.graph = OnceCell::new();
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<Arc<dyn Entity>>) -> Self {
        self.candidates = candidates;
        self.graph = OnceCell::new();
        self
    }

    pub fn with_api_source(mut self, api_source: impl Into<String>) -> Self {
        self.api_source = api_source.into();
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationFields) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn with_feature_overrides(mut self, overrides: FeatureMap) -> Self {
        self.feature_overrides = Some(overrides);
        self
    }

    pub fn include_events(mut self, include: bool) -> Self {
        self.include_events = include;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn api_source(&self) -> &str {
        &self.api_source
    }

    /// Candidates in caller order
    pub fn candidates(&self) -> &[Arc<dyn Entity>] {
        &self.candidates
    }

    pub fn wants_events(&self) -> bool {
        self.include_events
    }

    pub fn pagination(&self) -> Option<&PaginationFields> {
        self.pagination.as_ref()
    }

    pub fn feature_overrides(&self) -> Option<&FeatureMap> {
        self.feature_overrides.as_ref()
    }

    /// Request-level entities and their nested entities, excluding anything
    /// that is also a candidate
    pub fn context_entities(&self) -> &[Arc<dyn Entity>] {
        &self.graph().context
    }

    /// Candidates and their nested entities, deduplicated
    pub fn candidate_entities(&self) -> &[Arc<dyn Entity>] {
        &self.graph().candidates
    }

    /// Context entities followed by candidate entities
    pub fn all_entities(&self) -> Vec<Arc<dyn Entity>> {
        let graph = self.graph();
        graph
            .context
            .iter()
            .chain(graph.candidates.iter())
            .cloned()
            .collect()
    }

    /// Request identifier first, then every entity of the graph
    pub fn all_identifiers(&self) -> &[Identifier] {
        &self.graph().identifiers
    }

    fn graph(&self) -> &RequestGraph {
        self.graph.get_or_init(|| {
            let candidates = collect_entity_graph(&self.candidates);
            let context: Vec<Arc<dyn Entity>> = {
                let candidate_ids: HashSet<&Identifier> =
                    candidates.iter().map(|e| e.identifier()).collect();
                collect_entity_graph(&self.context)
                    .into_iter()
                    .filter(|e| !candidate_ids.contains(e.identifier()))
                    .collect()
            };

            let identifiers = std::iter::once(self.identifier.clone())
                .chain(context.iter().map(|e| e.identifier().clone()))
                .chain(candidates.iter().map(|e| e.identifier().clone()))
                .collect();

            RequestGraph {
                context,
                candidates,
                identifiers,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BrandEntity, ProductEntity, QueryEntity, UserEntity};

    fn request() -> PipelineRequest {
        PipelineRequest::new("req-1", "product_search")
            .with_context(Arc::new(QueryEntity::new("shoes")))
            .with_context(Arc::new(UserEntity::new("u1")))
            .with_candidates(vec![
                Arc::new(ProductEntity::new("p1").with_brand(BrandEntity::new("nike"))),
                Arc::new(ProductEntity::new("p2").with_brand(BrandEntity::new("nike"))),
            ])
    }

    #[test]
    fn test_all_identifiers_start_with_request() {
        let ids: Vec<String> = request()
            .all_identifiers()
            .iter()
            .map(|id| id.to_string())
            .collect();

        assert_eq!(
            ids,
            vec![
                "request::req-1",
                "query::shoes",
                "user::u1",
                "product::p1",
                "brand::nike",
                "product::p2",
            ]
        );
    }

    #[test]
    fn test_context_excludes_candidates() {
        let req = PipelineRequest::new("req-2", "product_search")
            .with_context(Arc::new(ProductEntity::new("p1")))
            .with_candidates(vec![Arc::new(ProductEntity::new("p1"))]);

        assert!(req.context_entities().is_empty());
        assert_eq!(req.candidate_entities().len(), 1);
        assert_eq!(req.all_identifiers().len(), 2);
    }

    #[test]
    fn test_graph_recomputed_after_builder_change() {
        let req = request();
        assert_eq!(req.all_entities().len(), 5);

        let req = req.with_candidates(vec![Arc::new(ProductEntity::new("p9"))]);
        assert_eq!(req.all_entities().len(), 3);
    }
}
