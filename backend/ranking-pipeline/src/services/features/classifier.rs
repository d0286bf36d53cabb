use super::realtime::RealtimeFeatureRegistry;
use crate::models::feature_owner;
use std::collections::{BTreeMap, BTreeSet};

/// Requested feature names split by where they come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureClassification {
    pub store_feature_names: BTreeSet<String>,
    /// Owning component name -> feature names it must produce
    pub realtime_feature_names: BTreeMap<String, BTreeSet<String>>,
}

impl FeatureClassification {
    pub fn is_realtime(&self, feature_name: &str) -> bool {
        self.realtime_feature_names
            .values()
            .any(|names| names.contains(feature_name))
    }

    pub fn all_realtime_feature_names(&self) -> BTreeSet<String> {
        self.realtime_feature_names
            .values()
            .flat_map(|names| names.iter().cloned())
            .collect()
    }

    pub fn all_feature_names(&self) -> BTreeSet<String> {
        let mut names = self.all_realtime_feature_names();
        names.extend(self.store_feature_names.iter().cloned());
        names
    }
}

/// Split requested names into store and real-time buckets.
///
/// A name is real-time when a registered component declares it, when one of
/// the owning component's families matches it, or when its owner is listed
/// in `realtime_overrides`. Everything else, including names nobody knows,
/// is left to the store.
pub fn classify<'a, I>(
    requested: I,
    registry: &RealtimeFeatureRegistry,
    realtime_overrides: &BTreeSet<String>,
) -> FeatureClassification
where
    I: IntoIterator<Item = &'a String>,
{
    let mut classification = FeatureClassification::default();

    for name in requested {
        let owner = registry
            .owner_of(name)
            .map(|component| component.descriptor().name().to_string())
            .or_else(|| {
                feature_owner(name)
                    .filter(|prefix| {
                        realtime_overrides.contains(*prefix) && registry.get(prefix).is_some()
                    })
                    .map(str::to_string)
            });

        match owner {
            Some(component) => {
                classification
                    .realtime_feature_names
                    .entry(component)
                    .or_default()
                    .insert(name.clone());
            }
            None => {
                classification.store_feature_names.insert(name.clone());
            }
        }
    }

    classification
}
