pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{ErrorKind, PipelineError, Result};
pub use services::{
    BusinessLogicPipeline, FeatureRetrievalPipeline, ModelExecutor, PaginationComponent,
    RankingPipeline, RankingPipelineBuilder, SingleEntityPipeline, SingleEntityPipelineBuilder,
};
