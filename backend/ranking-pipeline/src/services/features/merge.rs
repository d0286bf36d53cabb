use crate::models::{FeatureData, FeatureMap, Identifier};

/// Real-time output tagged with where it came from
#[derive(Debug, Clone)]
pub struct RealtimeResult {
    /// Registration position of the producing component
    pub component_position: usize,
    /// Scheduling position within the fan-out
    pub sequence: usize,
    pub data: FeatureData,
}

/// Merge store values, real-time values and caller overrides.
///
/// Last writer wins per identifier and feature name: store first, then
/// real-time results in component registration order, then overrides.
/// Afterwards every identifier has an entry and every requested name a
/// value, absent where nobody wrote one.
pub fn merge_feature_maps<'a, N>(
    store: FeatureMap,
    mut realtime: Vec<RealtimeResult>,
    overrides: Option<&FeatureMap>,
    identifiers: &'a [Identifier],
    requested_feature_names: N,
) -> FeatureMap
where
    N: IntoIterator<Item = &'a String> + Clone,
{
    let mut merged = store;

    realtime.sort_by_key(|result| (result.component_position, result.sequence));
    for result in realtime {
        merged.apply(result.data);
    }

    if let Some(overrides) = overrides {
        merged.overlay(overrides);
    }

    merged.fill_absent(identifiers, requested_feature_names);
    merged
}
