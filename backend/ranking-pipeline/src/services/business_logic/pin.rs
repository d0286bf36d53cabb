use super::{identifier_key, BusinessLogicStage, EntityKeyFn};
use crate::error::Result;
use crate::models::{PipelineRequest, ScoredCandidate};
use crate::services::component::{Component, InitGate};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::debug;

/// Move pinned candidates to fixed zero-indexed positions.
///
/// `candidates` must be sorted by descending score. Targets past the end
/// clamp to the last slot. Without `allow_down_ranking`, a pin that would
/// move its candidate further down is ignored. Pins are placed in ascending
/// target order; when two share a target the later candidate keeps the
/// slot and the earlier one takes the nearest free slot after it (or
/// before it, at the end of the list). Unpinned candidates fill the
/// remaining slots in their input order.
///
/// Pinned candidates are rescored between their unpinned neighbours so
/// that a stable descending sort reproduces the returned order.
pub fn pin(
    candidates: &[ScoredCandidate],
    pins: &HashMap<String, usize>,
    key_fn: &EntityKeyFn,
    allow_down_ranking: bool,
) -> Vec<ScoredCandidate> {
    let n = candidates.len();
    if n == 0 || pins.is_empty() {
        return candidates.to_vec();
    }

    let mut requested: Vec<(usize, usize)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, candidate)| {
            let target = (*pins.get(&key_fn(candidate.entity.as_ref()))?).min(n - 1);
            (allow_down_ranking || target <= index).then_some((target, index))
        })
        .collect();
    if requested.is_empty() {
        return candidates.to_vec();
    }
    requested.sort_by_key(|&(target, index)| (target, Reverse(index)));

    let mut slots: Vec<Option<usize>> = vec![None; n];
    let mut pinned = vec![false; n];
    for (target, index) in requested {
        let free = (target..n)
            .chain((0..target).rev())
            .find(|&slot| slots[slot].is_none());
        if let Some(slot) = free {
            if slot != target {
                debug!(target, slot, "pin collision, shifting candidate");
            }
            slots[slot] = Some(index);
            pinned[index] = true;
        }
    }

    let mut unpinned = (0..n).filter(|&index| !pinned[index]);
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        *slot = unpinned.next();
    }
    let order: Vec<usize> = slots.into_iter().flatten().collect();

    let mut result = Vec::with_capacity(n);
    let mut position = 0;
    while position < order.len() {
        if !pinned[order[position]] {
            result.push(candidates[order[position]].clone());
            position += 1;
            continue;
        }

        let run_start = position;
        while position < order.len() && pinned[order[position]] {
            position += 1;
        }
        let run_len = position - run_start;
        let upper = run_start
            .checked_sub(1)
            .map(|above| candidates[order[above]].score);
        let lower = order.get(position).map(|&below| candidates[below].score);

        for k in 0..run_len {
            let score = interpolated_score(upper, lower, k, run_len);
            result.push(candidates[order[run_start + k]].with_score(score));
        }
    }

    result
}

/// Score of the `k`-th entry of a run of `len` pinned candidates sitting
/// between unpinned scores `upper` and `lower`
fn interpolated_score(upper: Option<f64>, lower: Option<f64>, k: usize, len: usize) -> f64 {
    let (k, len) = (k as f64, len as f64);
    match (upper, lower) {
        (Some(high), Some(low)) => high - (high - low) * (k + 1.0) / (len + 1.0),
        (Some(high), None) => high - (k + 1.0),
        (None, Some(low)) => low + (len - k),
        (None, None) => len - k,
    }
}

pub struct PinStage {
    name: String,
    pins: HashMap<String, usize>,
    allow_down_ranking: bool,
    key_fn: EntityKeyFn,
    gate: InitGate,
}

impl PinStage {
    pub fn new<I, S>(name: impl Into<String>, pins: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            pins: pins.into_iter().map(|(key, slot)| (key.into(), slot)).collect(),
            allow_down_ranking: false,
            key_fn: identifier_key(),
            gate: InitGate::new(),
        }
    }

    pub fn allow_down_ranking(mut self, allow: bool) -> Self {
        self.allow_down_ranking = allow;
        self
    }

    pub fn with_key_fn(mut self, key_fn: EntityKeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }
}

#[async_trait]
impl Component for PinStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }
}

#[async_trait]
impl BusinessLogicStage for PinStage {
    async fn apply(
        &self,
        _request: &PipelineRequest,
        candidates: &[ScoredCandidate],
    ) -> Result<Vec<ScoredCandidate>> {
        Ok(pin(candidates, &self.pins, &self.key_fn, self.allow_down_ranking))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{sort_by_score_desc, ProductEntity};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ranked(scores: &[(&str, f64)]) -> Vec<ScoredCandidate> {
        scores
            .iter()
            .map(|(id, score)| ScoredCandidate::new(Arc::new(ProductEntity::new(*id)), *score))
            .collect()
    }

    fn pins(raw: &[(&str, usize)]) -> HashMap<String, usize> {
        raw.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn order(candidates: &[ScoredCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.identifier().value()).collect()
    }

    /// Pin, then re-sort the way the pipeline does
    fn pin_and_sort(
        candidates: &[ScoredCandidate],
        raw: &[(&str, usize)],
        allow_down_ranking: bool,
    ) -> Vec<ScoredCandidate> {
        let mut pinned = pin(candidates, &pins(raw), &identifier_key(), allow_down_ranking);
        let before = order(&pinned).into_iter().map(String::from).collect::<Vec<_>>();
        sort_by_score_desc(&mut pinned);
        assert_eq!(order(&pinned), before, "scores must reproduce the pinned order");
        pinned
    }

    #[test]
    fn test_pin_to_top() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8), ("C", 0.7)]);
        let pinned = pin_and_sort(&candidates, &[("C", 0)], false);

        assert_eq!(order(&pinned), vec!["C", "A", "B"]);
        assert_eq!(pinned[1].score, 0.9);
        assert_eq!(pinned[2].score, 0.8);
        assert!(pinned[0].score > 0.9);
    }

    #[test]
    fn test_pin_into_the_middle() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8), ("C", 0.7), ("D", 0.6)]);
        let pinned = pin_and_sort(&candidates, &[("D", 1)], false);
        assert_eq!(order(&pinned), vec!["A", "D", "B", "C"]);
    }

    #[test]
    fn test_down_ranking_needs_permission() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8), ("C", 0.7)]);

        let kept = pin_and_sort(&candidates, &[("A", 2)], false);
        assert_eq!(order(&kept), vec!["A", "B", "C"]);
        assert_eq!(kept[0].score, 0.9);

        let moved = pin_and_sort(&candidates, &[("A", 2)], true);
        assert_eq!(order(&moved), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_target_past_the_end_clamps_to_last_slot() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8), ("C", 0.7)]);
        let pinned = pin_and_sort(&candidates, &[("A", 50)], true);
        assert_eq!(order(&pinned), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_colliding_pins_keep_every_candidate_once() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8), ("C", 0.7), ("D", 0.6)]);
        let pinned = pin_and_sort(&candidates, &[("C", 1), ("D", 1)], false);

        assert_eq!(order(&pinned), vec!["A", "D", "C", "B"]);
        let unique: HashSet<&str> = order(&pinned).into_iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn test_pins_at_the_end_of_the_list() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8), ("C", 0.7)]);
        let pinned = pin_and_sort(&candidates, &[("A", 2), ("B", 2)], true);

        assert_eq!(order(&pinned), vec!["C", "A", "B"]);
    }

    #[test]
    fn test_every_candidate_pinned() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8)]);
        let pinned = pin_and_sort(&candidates, &[("A", 1), ("B", 0)], true);
        assert_eq!(order(&pinned), vec!["B", "A"]);
    }

    #[test]
    fn test_unknown_keys_leave_candidates_untouched() {
        let candidates = ranked(&[("A", 0.9), ("B", 0.8)]);
        let pinned = pin(&candidates, &pins(&[("Z", 0)]), &identifier_key(), true);
        assert_eq!(order(&pinned), vec!["A", "B"]);
        assert_eq!(pinned[0].score, 0.9);
    }
}
