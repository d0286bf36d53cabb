#![allow(dead_code)]

use async_trait::async_trait;
use event_schema::LoggedEvent;
use ranking_pipeline::models::{
    Entity, FeatureData, FeatureMap, FeatureValue, Identifier, ProductEntity, SimpleIdentifierType,
};
use ranking_pipeline::services::events::EventSink;
use ranking_pipeline::services::features::{
    FeatureStoreClient, RealtimeFeatureComponent, RealtimeFeatureDescriptor, RealtimeFeatureRequest,
};
use ranking_pipeline::services::{Component, InitGate};
use ranking_pipeline::{PipelineError, Result};
use tokio::sync::mpsc;

/// `price:bucket` = product price / 100
pub struct PriceBucketFeature {
    descriptor: RealtimeFeatureDescriptor,
    gate: InitGate,
}

impl PriceBucketFeature {
    pub fn new() -> Self {
        Self {
            descriptor: RealtimeFeatureDescriptor::new("price")
                .primary(SimpleIdentifierType::Product)
                .outputs(["bucket"]),
            gate: InitGate::new(),
        }
    }
}

#[async_trait]
impl Component for PriceBucketFeature {
    fn name(&self) -> &str {
        self.descriptor.name()
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }
}

#[async_trait]
impl RealtimeFeatureComponent for PriceBucketFeature {
    fn descriptor(&self) -> &RealtimeFeatureDescriptor {
        &self.descriptor
    }

    async fn compute_features(
        &self,
        entity: &dyn Entity,
        _input: RealtimeFeatureRequest<'_>,
    ) -> Result<Option<FeatureData>> {
        let Some(product) = entity.as_any().downcast_ref::<ProductEntity>() else {
            return Ok(None);
        };
        let value = product
            .price
            .map(|price| FeatureValue::Float(price / 100.0))
            .unwrap_or_default();
        Ok(Some(
            FeatureData::new(entity.identifier().clone()).with_feature("bucket", value),
        ))
    }
}

/// Store that is always down
pub struct UnreachableStore;

#[async_trait]
impl FeatureStoreClient for UnreachableStore {
    async fn fetch(&self, _: &[Identifier], _: &[String]) -> Result<FeatureMap> {
        Err(PipelineError::FeatureStore("connection refused".to_string()))
    }
}

/// Forwards published batches to a channel
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Vec<LoggedEvent>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<LoggedEvent>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, events: Vec<LoggedEvent>) {
        let _ = self.sender.send(events);
    }
}

pub fn product(id: &str, price: f64) -> ProductEntity {
    ProductEntity::new(id).with_price(price)
}
