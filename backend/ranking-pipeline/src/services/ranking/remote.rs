use super::{ModelComponent, ModelInput, ModelScore};
use crate::error::{PipelineError, Result};
use crate::models::Entity;
use crate::services::component::{Component, InitGate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// External model host scoring payloads in bulk
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Outputs aligned by position with `identifiers`; `null` when the
    /// host declines an entity
    async fn infer(&self, identifiers: Vec<String>, payloads: Vec<Value>) -> Result<Vec<Value>>;
}

/// Model delegating to an `InferenceBackend`. Each entity's payload is a
/// JSON object of its manifest features.
pub struct RemoteModelComponent {
    name: String,
    backend: Arc<dyn InferenceBackend>,
    manifest: BTreeSet<String>,
    gate: InitGate,
}

impl RemoteModelComponent {
    pub fn new<I, S>(name: impl Into<String>, backend: Arc<dyn InferenceBackend>, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            backend,
            manifest: features.into_iter().map(Into::into).collect(),
            gate: InitGate::new(),
        }
    }

    fn payload(&self, input: &ModelInput<'_>, entity: &dyn Entity) -> Value {
        let mut payload = Map::new();
        for feature in &self.manifest {
            let value = input
                .features
                .feature(entity.identifier(), feature)
                .map(|v| v.to_json())
                .unwrap_or(Value::Null);
            payload.insert(feature.clone(), value);
        }
        Value::Object(payload)
    }
}

#[async_trait]
impl Component for RemoteModelComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }

    fn manifest_feature_names(&self) -> &BTreeSet<String> {
        &self.manifest
    }
}

#[async_trait]
impl ModelComponent for RemoteModelComponent {
    async fn batch_inference(
        &self,
        input: ModelInput<'_>,
        batch: &[Arc<dyn Entity>],
    ) -> Result<Vec<Option<ModelScore>>> {
        let identifiers: Vec<String> = batch
            .iter()
            .map(|entity| entity.identifier().value().to_string())
            .collect();
        let payloads: Vec<Value> = batch
            .iter()
            .map(|entity| self.payload(&input, entity.as_ref()))
            .collect();

        debug!(model = %self.name, batch_len = batch.len(), "calling inference backend");
        let outputs = self
            .backend
            .infer(identifiers, payloads)
            .await
            .map_err(|e| match e {
                PipelineError::Timeout(_) | PipelineError::Inference(_) => e,
                other => PipelineError::Inference(other.to_string()),
            })?;

        Ok(outputs.iter().map(ModelScore::from_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureMap, FeatureValue, PipelineRequest, ProductEntity};
    use crate::services::ranking::InferencePolicy;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct EchoBackend {
        calls: Mutex<Vec<(Vec<String>, Vec<Value>)>>,
    }

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        async fn infer(&self, identifiers: Vec<String>, payloads: Vec<Value>) -> Result<Vec<Value>> {
            let outputs = payloads
                .iter()
                .map(|payload| payload["fv:ctr"].clone())
                .collect();
            self.calls.lock().unwrap().push((identifiers, payloads));
            Ok(outputs)
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl InferenceBackend for BrokenBackend {
        async fn infer(&self, _: Vec<String>, _: Vec<Value>) -> Result<Vec<Value>> {
            Err(PipelineError::Internal("503 from model host".into()))
        }
    }

    #[tokio::test]
    async fn test_payloads_carry_manifest_features() {
        let backend = Arc::new(EchoBackend::default());
        let model = RemoteModelComponent::new("remote", backend.clone(), ["fv:ctr"]);
        let request = PipelineRequest::new("r", "search");
        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(ProductEntity::new("p1")),
            Arc::new(ProductEntity::new("p2")),
            Arc::new(ProductEntity::new("p3")),
        ];
        let mut features = FeatureMap::new();
        features.set(entities[0].identifier(), "fv:ctr", FeatureValue::Float(0.3));
        features.set(entities[1].identifier(), "fv:ctr", FeatureValue::Absent);

        let policy = InferencePolicy {
            batch_size: 2,
            ..InferencePolicy::default()
        };
        let output = model
            .inference(ModelInput::new(&request, &entities, &features), &policy)
            .await
            .unwrap();

        assert_eq!(output.score_for(entities[0].identifier()), 0.3);
        assert_eq!(output.get(entities[1].identifier()), None);
        assert_eq!(output.get(entities[2].identifier()), None);

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let first = calls.iter().find(|(ids, _)| ids[0] == "p1").unwrap();
        assert_eq!(first.1[0], json!({"fv:ctr": 0.3}));
        assert_eq!(first.1[1], json!({"fv:ctr": null}));
    }

    #[tokio::test]
    async fn test_backend_errors_become_inference_errors() {
        let model = RemoteModelComponent::new("remote", Arc::new(BrokenBackend), ["fv:ctr"]);
        let request = PipelineRequest::new("r", "search");
        let entities: Vec<Arc<dyn Entity>> = vec![Arc::new(ProductEntity::new("p1"))];
        let features = FeatureMap::new();

        let err = model
            .inference(
                ModelInput::new(&request, &entities, &features),
                &InferencePolicy::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }
}
