use super::entity::Entity;
use super::identifier::Identifier;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// An entity together with its current score
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub entity: Arc<dyn Entity>,
    pub score: f64,
}

impl ScoredCandidate {
    pub fn new(entity: Arc<dyn Entity>, score: f64) -> Self {
        Self { entity, score }
    }

    /// Candidate that no stage has scored yet
    pub fn unscored(entity: Arc<dyn Entity>) -> Self {
        Self::new(entity, 0.0)
    }

    pub fn identifier(&self) -> &Identifier {
        self.entity.identifier()
    }

    pub fn with_score(&self, score: f64) -> Self {
        Self {
            entity: Arc::clone(&self.entity),
            score,
        }
    }
}

/// Stable sort by descending score. NaN scores sink to the bottom.
pub fn sort_by_score_desc(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| compare_scores_desc(a.score, b.score));
}

fn compare_scores_desc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Ranked entity as returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntity {
    pub entity_id: String,
    pub ranked_score: f64,
}

impl From<&ScoredCandidate> for RankedEntity {
    fn from(candidate: &ScoredCandidate) -> Self {
        Self {
            entity_id: candidate.identifier().value().to_string(),
            ranked_score: candidate.score,
        }
    }
}
