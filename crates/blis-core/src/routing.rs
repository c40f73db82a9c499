//! Routing policies and the weighted multi-scorer pipeline.
//!
//! Because cluster events drain before instance events at equal time, a
//! routing decision at tick T observes every other routing decision's
//! effect on `PendingRequests` at tick T, but not yet any instance step's
//! effect at tick T — the sole source of `kv-utilization`'s intentional,
//! contractual staleness.

use crate::prefix_index::PrefixCacheIndex;
use blis_common::InstanceId;

/// Read-only per-instance load snapshot, refreshed by `ClusterSimulator`
/// before each routing decision. Instances never hand out mutable
/// references to themselves for routing — this avoids cyclic ownership.
#[derive(Debug, Clone, Copy)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub pending_requests: usize,
    pub kv_utilization: f64,
}

impl InstanceSnapshot {
    pub fn effective_load(&self) -> usize {
        self.queue_depth + self.batch_size + self.pending_requests
    }
}

pub struct RoutingContext<'a> {
    pub request_prefix_hashes: &'a [u64],
    pub prefix_index: &'a PrefixCacheIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScorerKind {
    PrefixAffinity,
    QueueDepth,
    KvUtilization,
}

impl ScorerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScorerKind::PrefixAffinity => "prefix-affinity",
            ScorerKind::QueueDepth => "queue-depth",
            ScorerKind::KvUtilization => "kv-utilization",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "prefix-affinity" => Some(ScorerKind::PrefixAffinity),
            "queue-depth" => Some(ScorerKind::QueueDepth),
            "kv-utilization" => Some(ScorerKind::KvUtilization),
            _ => None,
        }
    }

    /// Raw (un-normalized) score for one candidate. Higher is always
    /// better after this call — load-based scorers return the negated
    /// load so every scorer shares the "higher is better" convention
    /// before normalization.
    fn raw_score(&self, candidate: &InstanceSnapshot, ctx: &RoutingContext) -> f64 {
        match self {
            ScorerKind::PrefixAffinity => {
                if ctx.request_prefix_hashes.is_empty() {
                    0.0
                } else {
                    let matching = ctx
                        .prefix_index
                        .matching_blocks(ctx.request_prefix_hashes, candidate.id);
                    matching as f64 / ctx.request_prefix_hashes.len() as f64
                }
            }
            ScorerKind::QueueDepth => -(candidate.queue_depth as f64 + candidate.batch_size as f64),
            ScorerKind::KvUtilization => -candidate.kv_utilization,
        }
    }
}

/// Min-max normalize `raw` to `[0, 1]`. When every candidate ties, all
/// candidates get the same neutral score (1.0) — they're indistinguishable
/// on this scorer, so it contributes nothing to breaking the tie.
fn normalize(raw: &[f64]) -> Vec<f64> {
    let min = raw.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return vec![1.0; raw.len()];
    }
    raw.iter().map(|&v| (v - min) / (max - min)).collect()
}

#[derive(Debug, Clone)]
pub struct ScorerBreakdown {
    pub scorer: &'static str,
    pub weight: u32,
    pub raw: f64,
    pub normalized: f64,
}

#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub instance_id: InstanceId,
    pub score: f64,
    pub breakdown: Vec<ScorerBreakdown>,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub chosen: InstanceId,
    pub candidates: Vec<CandidateScore>,
    /// Top-K alternative candidates by score (excluding the chosen one),
    /// each with its regret `max_alt(score) - score(chosen)` — here simply
    /// `candidate.score - chosen.score`, which is <= 0 by construction.
    pub top_k_counterfactuals: Vec<(InstanceId, f64)>,
}

#[derive(Debug, Clone)]
pub enum RoutingPolicy {
    RoundRobin { next: usize },
    LeastLoaded,
    PrefixAffinity,
    Weighted { scorers: Vec<(ScorerKind, u32)> },
    /// Diagnostic only: routes to the busiest instance, useful for
    /// stress-testing preemption and offload paths, not intended as a
    /// production policy.
    AlwaysBusiest,
}

impl RoutingPolicy {
    pub fn route(
        &mut self,
        candidates: &[InstanceSnapshot],
        ctx: &RoutingContext,
        counterfactual_k: usize,
    ) -> RoutingDecision {
        assert!(!candidates.is_empty(), "route requires at least one candidate instance");
        match self {
            RoutingPolicy::RoundRobin { next } => {
                let idx = *next % candidates.len();
                *next = (*next + 1) % candidates.len();
                let chosen = candidates[idx].id;
                single_scorer_decision(candidates, chosen, "round-robin", 0.0)
            }
            RoutingPolicy::LeastLoaded => {
                let chosen = candidates
                    .iter()
                    .min_by_key(|c| (c.effective_load(), c.id))
                    .unwrap()
                    .id;
                let raws: Vec<f64> = candidates.iter().map(|c| -(c.effective_load() as f64)).collect();
                decision_from_raw(candidates, &raws, "least-loaded", chosen)
            }
            RoutingPolicy::PrefixAffinity => {
                let raws: Vec<f64> = candidates
                    .iter()
                    .map(|c| ScorerKind::PrefixAffinity.raw_score(c, ctx))
                    .collect();
                let chosen = argmax_tie_ascending(candidates, &raws);
                decision_from_raw(candidates, &raws, "prefix-affinity", chosen)
            }
            RoutingPolicy::AlwaysBusiest => {
                let chosen = candidates
                    .iter()
                    .max_by_key(|c| (c.effective_load(), std::cmp::Reverse(c.id)))
                    .unwrap()
                    .id;
                let raws: Vec<f64> = candidates.iter().map(|c| c.effective_load() as f64).collect();
                decision_from_raw(candidates, &raws, "always-busiest", chosen)
            }
            RoutingPolicy::Weighted { scorers } => weighted_route(candidates, ctx, scorers),
        }
        .with_counterfactuals(counterfactual_k)
    }
}

fn argmax_tie_ascending(candidates: &[InstanceSnapshot], scores: &[f64]) -> InstanceId {
    let mut best_idx = 0;
    for i in 1..candidates.len() {
        if scores[i] > scores[best_idx]
            || (scores[i] == scores[best_idx] && candidates[i].id < candidates[best_idx].id)
        {
            best_idx = i;
        }
    }
    candidates[best_idx].id
}

fn single_scorer_decision(
    candidates: &[InstanceSnapshot],
    chosen: InstanceId,
    name: &'static str,
    default_score: f64,
) -> RoutingDecision {
    let candidates_out = candidates
        .iter()
        .map(|c| CandidateScore {
            instance_id: c.id,
            score: if c.id == chosen { 1.0 } else { default_score },
            breakdown: vec![ScorerBreakdown {
                scorer: name,
                weight: 1,
                raw: 0.0,
                normalized: if c.id == chosen { 1.0 } else { default_score },
            }],
        })
        .collect();
    RoutingDecision {
        chosen,
        candidates: candidates_out,
        top_k_counterfactuals: Vec::new(),
    }
}

fn decision_from_raw(
    candidates: &[InstanceSnapshot],
    raws: &[f64],
    name: &'static str,
    chosen: InstanceId,
) -> RoutingDecision {
    let normalized = normalize(raws);
    let candidates_out = candidates
        .iter()
        .zip(raws.iter())
        .zip(normalized.iter())
        .map(|((c, &raw), &norm)| CandidateScore {
            instance_id: c.id,
            score: norm,
            breakdown: vec![ScorerBreakdown {
                scorer: name,
                weight: 1,
                raw,
                normalized: norm,
            }],
        })
        .collect();
    RoutingDecision {
        chosen,
        candidates: candidates_out,
        top_k_counterfactuals: Vec::new(),
    }
}

fn weighted_route(
    candidates: &[InstanceSnapshot],
    ctx: &RoutingContext,
    scorers: &[(ScorerKind, u32)],
) -> RoutingDecision {
    let weight_sum: f64 = scorers.iter().map(|(_, w)| *w as f64).sum();
    let mut per_scorer_normalized: Vec<Vec<f64>> = Vec::with_capacity(scorers.len());
    let mut per_scorer_raw: Vec<Vec<f64>> = Vec::with_capacity(scorers.len());
    for (kind, _) in scorers {
        let raw: Vec<f64> = candidates.iter().map(|c| kind.raw_score(c, ctx)).collect();
        per_scorer_normalized.push(normalize(&raw));
        per_scorer_raw.push(raw);
    }

    let mut combined = vec![0.0; candidates.len()];
    for (i, (_, weight)) in scorers.iter().enumerate() {
        for (j, norm) in per_scorer_normalized[i].iter().enumerate() {
            combined[j] += (*weight as f64) * norm;
        }
    }
    if weight_sum > 0.0 {
        for v in &mut combined {
            *v /= weight_sum;
        }
    }

    let chosen = argmax_tie_ascending(candidates, &combined);

    let candidates_out = candidates
        .iter()
        .enumerate()
        .map(|(j, c)| {
            let breakdown = scorers
                .iter()
                .enumerate()
                .map(|(i, (kind, weight))| ScorerBreakdown {
                    scorer: kind.name(),
                    weight: *weight,
                    raw: per_scorer_raw[i][j],
                    normalized: per_scorer_normalized[i][j],
                })
                .collect();
            CandidateScore {
                instance_id: c.id,
                score: combined[j],
                breakdown,
            }
        })
        .collect();

    RoutingDecision {
        chosen,
        candidates: candidates_out,
        top_k_counterfactuals: Vec::new(),
    }
}

impl RoutingDecision {
    fn with_counterfactuals(mut self, k: usize) -> Self {
        let chosen_score = self
            .candidates
            .iter()
            .find(|c| c.instance_id == self.chosen)
            .map(|c| c.score)
            .unwrap_or(0.0);
        let mut alternatives: Vec<(InstanceId, f64)> = self
            .candidates
            .iter()
            .filter(|c| c.instance_id != self.chosen)
            .map(|c| (c.instance_id, c.score - chosen_score))
            .collect();
        alternatives.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        alternatives.truncate(k);
        self.top_k_counterfactuals = alternatives;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: InstanceId, queue_depth: usize, batch_size: usize, pending: usize, kv: f64) -> InstanceSnapshot {
        InstanceSnapshot {
            id,
            queue_depth,
            batch_size,
            pending_requests: pending,
            kv_utilization: kv,
        }
    }

    fn empty_ctx(idx: &PrefixCacheIndex) -> RoutingContext<'_> {
        RoutingContext {
            request_prefix_hashes: &[],
            prefix_index: idx,
        }
    }

    #[test]
    fn round_robin_cycles_and_tracks_state() {
        let idx = PrefixCacheIndex::new(10);
        let ctx = empty_ctx(&idx);
        let candidates = vec![snap(0, 0, 0, 0, 0.0), snap(1, 0, 0, 0, 0.0), snap(2, 0, 0, 0, 0.0)];
        let mut policy = RoutingPolicy::RoundRobin { next: 0 };
        let chosen: Vec<InstanceId> = (0..4)
            .map(|_| policy.route(&candidates, &ctx, 0).chosen)
            .collect();
        assert_eq!(chosen, vec![0, 1, 2, 0]);
    }

    #[test]
    fn least_loaded_picks_minimum_effective_load() {
        let idx = PrefixCacheIndex::new(10);
        let ctx = empty_ctx(&idx);
        let candidates = vec![snap(0, 5, 0, 0, 0.0), snap(1, 1, 0, 0, 0.0), snap(2, 9, 0, 0, 0.0)];
        let mut policy = RoutingPolicy::LeastLoaded;
        assert_eq!(policy.route(&candidates, &ctx, 0).chosen, 1);
    }

    #[test]
    fn least_loaded_ties_break_by_ascending_id() {
        let idx = PrefixCacheIndex::new(10);
        let ctx = empty_ctx(&idx);
        let candidates = vec![snap(2, 3, 0, 0, 0.0), snap(0, 3, 0, 0, 0.0), snap(1, 3, 0, 0, 0.0)];
        let mut policy = RoutingPolicy::LeastLoaded;
        assert_eq!(policy.route(&candidates, &ctx, 0).chosen, 0);
    }

    #[test]
    fn weighted_combines_scorers_and_normalizes() {
        let idx = PrefixCacheIndex::new(10);
        let ctx = empty_ctx(&idx);
        let candidates = vec![snap(0, 10, 0, 0, 0.9), snap(1, 0, 0, 0, 0.1)];
        let mut policy = RoutingPolicy::Weighted {
            scorers: vec![(ScorerKind::QueueDepth, 1), (ScorerKind::KvUtilization, 1)],
        };
        // instance 1 has both lower queue depth and lower kv utilization
        assert_eq!(policy.route(&candidates, &ctx, 0).chosen, 1);
    }

    #[test]
    fn always_busiest_picks_max_effective_load() {
        let idx = PrefixCacheIndex::new(10);
        let ctx = empty_ctx(&idx);
        let candidates = vec![snap(0, 1, 0, 0, 0.0), snap(1, 9, 0, 0, 0.0)];
        let mut policy = RoutingPolicy::AlwaysBusiest;
        assert_eq!(policy.route(&candidates, &ctx, 0).chosen, 1);
    }

    #[test]
    fn counterfactual_regret_is_non_positive() {
        let idx = PrefixCacheIndex::new(10);
        let ctx = empty_ctx(&idx);
        let candidates = vec![snap(0, 1, 0, 0, 0.0), snap(1, 9, 0, 0, 0.0), snap(2, 5, 0, 0, 0.0)];
        let mut policy = RoutingPolicy::LeastLoaded;
        let decision = policy.route(&candidates, &ctx, 2);
        assert!(decision.top_k_counterfactuals.len() <= 2);
        for (_, regret) in &decision.top_k_counterfactuals {
            assert!(*regret <= 1e-9);
        }
    }

    #[test]
    fn prefix_affinity_scores_by_matching_ratio() {
        let mut idx = PrefixCacheIndex::new(10);
        idx.record(100, 1, 0);
        idx.record(200, 1, 0);
        let ctx = RoutingContext {
            request_prefix_hashes: &[100, 200, 300],
            prefix_index: &idx,
        };
        let candidates = vec![snap(0, 0, 0, 0, 0.0), snap(1, 0, 0, 0, 0.0)];
        let mut policy = RoutingPolicy::PrefixAffinity;
        assert_eq!(policy.route(&candidates, &ctx, 0).chosen, 1);
    }
}
