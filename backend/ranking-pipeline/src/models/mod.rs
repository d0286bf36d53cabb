pub mod candidate;
pub mod entity;
pub mod feature;
pub mod identifier;
pub mod request;

pub use candidate::{sort_by_score_desc, RankedEntity, ScoredCandidate};
pub use entity::{
    collect_entity_graph, BrandEntity, Entity, ProductEntity, QueryEntity, UserEntity,
};
pub use feature::{
    feature_owner, qualify_feature_name, FeatureData, FeatureMap, FeatureValue,
    FEATURE_NAME_SEPARATOR,
};
pub use identifier::{Identifier, IdentifierType, SimpleIdentifierType, COMPOSITE_SEPARATOR};
pub use request::{PaginationFields, PipelineRequest};
