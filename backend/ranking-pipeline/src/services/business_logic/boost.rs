use super::{identifier_key, BusinessLogicStage, EntityKeyFn};
use crate::error::Result;
use crate::models::{PipelineRequest, ScoredCandidate};
use crate::services::component::{Component, InitGate};
use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostMode {
    /// `new = old + factor`
    Additive,
    /// `new = old * factor`
    Multiplicative,
}

impl BoostMode {
    fn apply(self, score: f64, factor: f64) -> f64 {
        match self {
            BoostMode::Additive => score + factor,
            BoostMode::Multiplicative => score * factor,
        }
    }
}

/// Boost every candidate whose key is in `keys`; the rest pass through
pub fn boost(
    candidates: &[ScoredCandidate],
    keys: &HashSet<String>,
    factor: f64,
    mode: BoostMode,
    key_fn: &EntityKeyFn,
) -> Vec<ScoredCandidate> {
    candidates
        .iter()
        .map(|candidate| {
            if keys.contains(&key_fn(candidate.entity.as_ref())) {
                candidate.with_score(mode.apply(candidate.score, factor))
            } else {
                candidate.clone()
            }
        })
        .collect()
}

pub struct BoostStage {
    name: String,
    keys: HashSet<String>,
    factor: f64,
    mode: BoostMode,
    key_fn: EntityKeyFn,
    gate: InitGate,
}

impl BoostStage {
    pub fn new<I, S>(name: impl Into<String>, keys: I, factor: f64, mode: BoostMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            factor,
            mode,
            key_fn: identifier_key(),
            gate: InitGate::new(),
        }
    }

    pub fn with_key_fn(mut self, key_fn: EntityKeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }
}

#[async_trait]
impl Component for BoostStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }
}

#[async_trait]
impl BusinessLogicStage for BoostStage {
    async fn apply(
        &self,
        _request: &PipelineRequest,
        candidates: &[ScoredCandidate],
    ) -> Result<Vec<ScoredCandidate>> {
        Ok(boost(candidates, &self.keys, self.factor, self.mode, &self.key_fn))
    }
}
