// ============================================
// Real-time feature components
// ============================================
// Components compute features on the fly for a request, a single entity,
// or an ordered entity pair. Each one carries a descriptor listing the
// entity types it applies to and the feature names it produces.

use crate::error::{PipelineError, Result};
use crate::models::{
    qualify_feature_name, Entity, FeatureData, FeatureMap, PipelineRequest, SimpleIdentifierType,
    FEATURE_NAME_SEPARATOR,
};
use crate::services::component::Component;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Open-ended set of feature names owned by one component, e.g. names that
/// embed a runtime value. Consulted only when exact lookup fails.
pub trait FeatureFamily: Send + Sync {
    fn matches(&self, feature_name: &str) -> bool;
}

impl<F> FeatureFamily for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, feature_name: &str) -> bool {
        self(feature_name)
    }
}

/// Every name starting with a fixed, fully-qualified prefix
#[derive(Debug, Clone)]
pub struct PrefixFamily {
    prefix: String,
}

impl PrefixFamily {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl FeatureFamily for PrefixFamily {
    fn matches(&self, feature_name: &str) -> bool {
        feature_name.starts_with(&self.prefix) && feature_name.len() > self.prefix.len()
    }
}

/// Capability descriptor of a real-time component
#[derive(Clone)]
pub struct RealtimeFeatureDescriptor {
    name: String,
    primary: Option<SimpleIdentifierType>,
    secondary: Option<SimpleIdentifierType>,
    request_kind: Option<String>,
    output_feature_names: BTreeSet<String>,
    required_feature_names: BTreeSet<String>,
    families: Vec<Arc<dyn FeatureFamily>>,
}

impl fmt::Debug for RealtimeFeatureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeFeatureDescriptor")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("request_kind", &self.request_kind)
            .field("output_feature_names", &self.output_feature_names)
            .field("required_feature_names", &self.required_feature_names)
            .field("families", &self.families.len())
            .finish()
    }
}

impl RealtimeFeatureDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary: None,
            secondary: None,
            request_kind: None,
            output_feature_names: BTreeSet::new(),
            required_feature_names: BTreeSet::new(),
            families: Vec::new(),
        }
    }

    pub fn primary(mut self, entity_type: SimpleIdentifierType) -> Self {
        self.primary = Some(entity_type);
        self
    }

    pub fn secondary(mut self, entity_type: SimpleIdentifierType) -> Self {
        self.secondary = Some(entity_type);
        self
    }

    pub fn request_kind(mut self, kind: impl Into<String>) -> Self {
        self.request_kind = Some(kind.into());
        self
    }

    /// Declare output features. Bare names are qualified with the
    /// component name.
    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let qualified: Vec<String> = names
            .into_iter()
            .map(|name| qualify_feature_name(&self.name, name.as_ref()))
            .collect();
        self.output_feature_names.extend(qualified);
        self
    }

    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_feature_names
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn family(mut self, family: impl FeatureFamily + 'static) -> Self {
        self.families.push(Arc::new(family));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_feature_names(&self) -> &BTreeSet<String> {
        &self.output_feature_names
    }

    pub fn required_feature_names(&self) -> &BTreeSet<String> {
        &self.required_feature_names
    }

    /// Components with required features wait for the store fetch
    pub fn depends_on_store(&self) -> bool {
        !self.required_feature_names.is_empty()
    }

    pub fn produces_exactly(&self, feature_name: &str) -> bool {
        self.output_feature_names.contains(feature_name)
    }

    pub fn produces_family(&self, feature_name: &str) -> bool {
        feature_name
            .split_once(FEATURE_NAME_SEPARATOR)
            .map(|(prefix, _)| prefix == self.name)
            .unwrap_or(false)
            && self.families.iter().any(|family| family.matches(feature_name))
    }

    /// Type-shape check of the (request, primary, secondary) triple
    pub fn accepts(
        &self,
        request: &PipelineRequest,
        primary: Option<&dyn Entity>,
        secondary: Option<&dyn Entity>,
    ) -> bool {
        if let Some(kind) = &self.request_kind {
            if kind != request.kind() {
                return false;
            }
        }
        slot_matches(self.primary, primary) && slot_matches(self.secondary, secondary)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(FEATURE_NAME_SEPARATOR) {
            return Err(PipelineError::Configuration(format!(
                "invalid real-time component name '{}'",
                self.name
            )));
        }
        if self.secondary.is_some() && self.primary.is_none() {
            return Err(PipelineError::Configuration(format!(
                "component {} declares a secondary entity type without a primary one",
                self.name
            )));
        }
        if self.primary.is_none() && self.request_kind.is_none() {
            return Err(PipelineError::Configuration(format!(
                "component {} must declare an entity type or a request kind",
                self.name
            )));
        }
        Ok(())
    }
}

fn slot_matches(expected: Option<SimpleIdentifierType>, actual: Option<&dyn Entity>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(expected), Some(entity)) => entity.entity_type() == Some(expected),
        _ => false,
    }
}

/// What a real-time component sees besides its entities
#[derive(Debug, Clone, Copy)]
pub struct RealtimeFeatureRequest<'a> {
    pub request: &'a PipelineRequest,
    /// Store features; empty for components that run alongside the store
    /// fetch
    pub store_features: &'a FeatureMap,
}

#[async_trait]
pub trait RealtimeFeatureComponent: Component {
    fn descriptor(&self) -> &RealtimeFeatureDescriptor;

    fn can_execute_on(
        &self,
        request: &PipelineRequest,
        primary: Option<&dyn Entity>,
        secondary: Option<&dyn Entity>,
    ) -> bool {
        self.descriptor().accepts(request, primary, secondary)
    }

    async fn compute_request_features(
        &self,
        _input: RealtimeFeatureRequest<'_>,
    ) -> Result<Option<FeatureData>> {
        Ok(None)
    }

    async fn compute_features(
        &self,
        _entity: &dyn Entity,
        _input: RealtimeFeatureRequest<'_>,
    ) -> Result<Option<FeatureData>> {
        Ok(None)
    }

    async fn compute_composite_features(
        &self,
        _primary: &dyn Entity,
        _secondary: &dyn Entity,
        _input: RealtimeFeatureRequest<'_>,
    ) -> Result<Option<FeatureData>> {
        Ok(None)
    }

    /// Dispatch on the shape of the triple and qualify every emitted name
    async fn execute(
        &self,
        input: RealtimeFeatureRequest<'_>,
        primary: Option<&dyn Entity>,
        secondary: Option<&dyn Entity>,
    ) -> Result<Option<FeatureData>> {
        let computed = match (primary, secondary) {
            (Some(primary), Some(secondary)) => {
                self.compute_composite_features(primary, secondary, input)
                    .await?
            }
            (Some(entity), None) => self.compute_features(entity, input).await?,
            _ => self.compute_request_features(input).await?,
        };
        Ok(computed.map(|data| data.qualified(self.descriptor().name())))
    }
}

/// Real-time components available to one pipeline, in registration order
#[derive(Clone, Default)]
pub struct RealtimeFeatureRegistry {
    components: Vec<Arc<dyn RealtimeFeatureComponent>>,
    by_name: HashMap<String, usize>,
    by_output: HashMap<String, usize>,
}

impl fmt::Debug for RealtimeFeatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .components
            .iter()
            .map(|c| c.descriptor().name())
            .collect();
        f.debug_struct("RealtimeFeatureRegistry")
            .field("components", &names)
            .finish()
    }
}

impl RealtimeFeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Arc<dyn RealtimeFeatureComponent>) -> Result<()> {
        let descriptor = component.descriptor();
        descriptor.validate()?;

        let name = descriptor.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(PipelineError::Configuration(format!(
                "real-time component {} registered twice",
                name
            )));
        }

        let index = self.components.len();
        for output in descriptor.output_feature_names() {
            self.by_output.insert(output.clone(), index);
        }
        self.by_name.insert(name, index);
        self.components.push(component);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn RealtimeFeatureComponent>> {
        self.by_name.get(name).map(|index| &self.components[*index])
    }

    /// Registration position of a component
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn components(&self) -> &[Arc<dyn RealtimeFeatureComponent>] {
        &self.components
    }

    /// Component producing `feature_name`: exact declaration first, then
    /// the owning component's families
    pub fn owner_of(&self, feature_name: &str) -> Option<&Arc<dyn RealtimeFeatureComponent>> {
        if let Some(index) = self.by_output.get(feature_name) {
            return Some(&self.components[*index]);
        }
        let (prefix, _) = feature_name.split_once(FEATURE_NAME_SEPARATOR)?;
        self.get(prefix)
            .filter(|component| component.descriptor().produces_family(feature_name))
    }

    /// Union of the required feature names of every component
    pub fn required_feature_names(&self) -> BTreeSet<String> {
        self.components
            .iter()
            .flat_map(|c| c.descriptor().required_feature_names().iter().cloned())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{FeatureValue, Identifier};
    use crate::services::component::InitGate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits a fixed value per computed feature. Fails with a fetch error for
    /// entities listed in `fail_on` and with a configuration error for those
    /// in `misconfigured_on`.
    pub struct StaticFeature {
        descriptor: RealtimeFeatureDescriptor,
        gate: InitGate,
        value: f64,
        fail_on: Vec<String>,
        misconfigured_on: Vec<String>,
        pub calls: AtomicUsize,
        pub initializations: AtomicUsize,
    }

    impl StaticFeature {
        pub fn new(descriptor: RealtimeFeatureDescriptor, value: f64) -> Self {
            Self {
                descriptor,
                gate: InitGate::new(),
                value,
                fail_on: Vec::new(),
                misconfigured_on: Vec::new(),
                calls: AtomicUsize::new(0),
                initializations: AtomicUsize::new(0),
            }
        }

        pub fn failing_on(mut self, entity_id: &str) -> Self {
            self.fail_on.push(entity_id.to_string());
            self
        }

        pub fn misconfigured_on(mut self, entity_id: &str) -> Self {
            self.misconfigured_on.push(entity_id.to_string());
            self
        }

        fn data_for(&self, identifier: Identifier) -> Result<Option<FeatureData>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.iter().any(|id| id == identifier.value()) {
                return Err(PipelineError::realtime(
                    self.descriptor.name(),
                    format!("cannot compute for {}", identifier),
                ));
            }
            if self.misconfigured_on.iter().any(|id| id == identifier.value()) {
                return Err(PipelineError::Configuration(format!(
                    "{} has no credentials",
                    self.descriptor.name()
                )));
            }
            let mut data = FeatureData::new(identifier);
            for name in self.descriptor.output_feature_names() {
                data.features
                    .insert(name.clone(), FeatureValue::Float(self.value));
            }
            Ok(Some(data))
        }
    }

    #[async_trait]
    impl Component for StaticFeature {
        fn name(&self) -> &str {
            self.descriptor.name()
        }

        fn init_gate(&self) -> &InitGate {
            &self.gate
        }

        async fn initialize(&self) -> Result<()> {
            self.initializations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl RealtimeFeatureComponent for StaticFeature {
        fn descriptor(&self) -> &RealtimeFeatureDescriptor {
            &self.descriptor
        }

        async fn compute_request_features(
            &self,
            input: RealtimeFeatureRequest<'_>,
        ) -> Result<Option<FeatureData>> {
            self.data_for(input.request.identifier().clone())
        }

        async fn compute_features(
            &self,
            entity: &dyn Entity,
            _input: RealtimeFeatureRequest<'_>,
        ) -> Result<Option<FeatureData>> {
            self.data_for(entity.identifier().clone())
        }

        async fn compute_composite_features(
            &self,
            primary: &dyn Entity,
            secondary: &dyn Entity,
            _input: RealtimeFeatureRequest<'_>,
        ) -> Result<Option<FeatureData>> {
            let identifier = Identifier::composite(primary.identifier(), secondary.identifier())?;
            self.data_for(identifier)
        }
    }
}
