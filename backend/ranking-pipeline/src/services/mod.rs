pub mod business_logic;
pub mod component;
pub mod events;
pub mod features;
pub mod pagination;
pub mod pipeline;
pub mod ranking;
pub mod single_entity_pipeline;

pub use business_logic::{
    BoostMode, BoostStage, BusinessLogicPipeline, BusinessLogicStage, PinStage,
    SingleEntityBusinessLogicPipeline, SingleEntityStage,
};
pub use component::{Component, InitGate};
pub use events::{EventCollector, EventSink, TracingEventSink};
pub use features::{
    FeatureRetrievalPipeline, FeatureStoreClient, HttpFeatureStoreClient, InMemoryFeatureStore,
    RealtimeFeatureComponent, RealtimeFeatureDescriptor,
};
pub use pagination::PaginationComponent;
pub use pipeline::{RankingPipeline, RankingPipelineBuilder, RankingResponse};
pub use ranking::{LinearModel, ModelChain, ModelComponent, ModelExecutor, RemoteModelComponent};
pub use single_entity_pipeline::{
    SingleEntityPipeline, SingleEntityPipelineBuilder, SingleEntityResponse,
};
