//! Decision trace and per-request/aggregate metrics.
//!
//! `TraceRecorder` captures admission and routing decisions for `--trace-level
//! decisions`; `MetricsCollector` accumulates per-request timings and reduces
//! them to the aggregate summary printed to stdout. Per-request JSON reports
//! ITL and scheduling delay in milliseconds and everything else in native
//! microseconds; aggregate stdout stays entirely in microseconds.

use crate::request::RequestRuntime;
use crate::routing::RoutingDecision;
use blis_common::{InstanceId, Micros, RequestId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    None,
    Decisions,
}

impl TraceLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(TraceLevel::None),
            "decisions" => Some(TraceLevel::Decisions),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdmissionRecord {
    pub request_id: RequestId,
    pub time: Micros,
    pub admitted: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoutingRecord {
    pub request_id: RequestId,
    pub time: Micros,
    pub chosen_instance: InstanceId,
    pub scores: Vec<(InstanceId, f64)>,
    pub top_k_counterfactuals: Vec<(InstanceId, f64)>,
    pub regret: f64,
}

/// Records every admission and routing decision made this run, gated by
/// `--trace-level`. A `none` recorder still tallies admission/routing
/// counts (needed for `summarize_trace`) but drops the per-decision detail
/// to avoid paying for memory the run was not asked to spend.
pub struct TraceRecorder {
    level: TraceLevel,
    counterfactual_k: usize,
    admissions: Vec<AdmissionRecord>,
    routings: Vec<RoutingRecord>,
    admitted_count: u64,
    rejected_count: u64,
}

impl TraceRecorder {
    pub fn new(level: TraceLevel, counterfactual_k: usize) -> Self {
        Self {
            level,
            counterfactual_k,
            admissions: Vec::new(),
            routings: Vec::new(),
            admitted_count: 0,
            rejected_count: 0,
        }
    }

    pub fn record_admission(&mut self, request_id: RequestId, time: Micros, admitted: bool) {
        if admitted {
            self.admitted_count += 1;
        } else {
            self.rejected_count += 1;
        }
        if self.level == TraceLevel::Decisions {
            self.admissions.push(AdmissionRecord {
                request_id,
                time,
                admitted,
            });
        }
    }

    pub fn record_routing(&mut self, request_id: RequestId, time: Micros, decision: &RoutingDecision) {
        if self.level != TraceLevel::Decisions {
            return;
        }
        // Counterfactual regrets are <= 0 by construction (routing.rs); the
        // worst (closest-to-zero) alternative is the decision's regret.
        let regret = decision
            .top_k_counterfactuals
            .iter()
            .map(|(_, r)| *r)
            .fold(f64::NEG_INFINITY, f64::max);
        self.routings.push(RoutingRecord {
            request_id,
            time,
            chosen_instance: decision.chosen,
            scores: decision.candidates.iter().map(|c| (c.instance_id, c.score)).collect(),
            top_k_counterfactuals: decision
                .top_k_counterfactuals
                .iter()
                .take(self.counterfactual_k)
                .copied()
                .collect(),
            regret: if regret.is_finite() { regret } else { 0.0 },
        });
    }

    pub fn level(&self) -> TraceLevel {
        self.level
    }

    pub fn admissions(&self) -> &[AdmissionRecord] {
        &self.admissions
    }

    pub fn routings(&self) -> &[RoutingRecord] {
        &self.routings
    }

    /// `--summarize-trace`: mean/max regret, the distribution of chosen
    /// instances, admitted/rejected counts, and the number of distinct
    /// instances ever chosen.
    pub fn summarize(&self) -> TraceSummary {
        let regrets: Vec<f64> = self
            .routings
            .iter()
            .flat_map(|r| r.top_k_counterfactuals.iter().map(|(_, regret)| *regret))
            .collect();
        let mean_regret = if regrets.is_empty() {
            0.0
        } else {
            regrets.iter().sum::<f64>() / regrets.len() as f64
        };
        // regrets are <= 0 by construction; the worst case is the most negative.
        let max_regret = regrets.iter().cloned().fold(0.0_f64, f64::min);
        let mut target_distribution: HashMap<InstanceId, u64> = HashMap::new();
        for r in &self.routings {
            *target_distribution.entry(r.chosen_instance).or_insert(0) += 1;
        }
        let mut targets: Vec<InstanceId> = target_distribution.keys().copied().collect();
        targets.sort_unstable();
        let distribution = targets
            .iter()
            .map(|id| (*id, target_distribution[id]))
            .collect();
        TraceSummary {
            mean_regret,
            max_regret,
            target_distribution: distribution,
            admitted: self.admitted_count,
            rejected: self.rejected_count,
            unique_targets: target_distribution.len(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceSummary {
    pub mean_regret: f64,
    pub max_regret: f64,
    pub target_distribution: Vec<(InstanceId, u64)>,
    pub admitted: u64,
    pub rejected: u64,
    pub unique_targets: usize,
}

/// Per-request timings, all in native microseconds internally; unit
/// conversion happens only at JSON-serialization time.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub request_id: RequestId,
    pub tenant_id: String,
    pub instance_id: InstanceId,
    pub ttft_us: Micros,
    pub itl_us: f64,
    pub e2e_latency_us: Micros,
    pub scheduling_delay_us: Micros,
    pub preemption_count: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestMetricJson {
    pub request_id: RequestId,
    pub tenant_id: String,
    pub instance_id: InstanceId,
    pub ttft_us: Micros,
    /// Inter-token latency in milliseconds in the JSON output.
    pub itl_ms: f64,
    pub e2e_latency_us: Micros,
    /// Scheduling delay in milliseconds in the JSON output.
    pub scheduling_delay_ms: f64,
    pub preemption_count: u32,
}

impl From<&RequestMetric> for RequestMetricJson {
    fn from(m: &RequestMetric) -> Self {
        Self {
            request_id: m.request_id,
            tenant_id: m.tenant_id.clone(),
            instance_id: m.instance_id,
            ttft_us: m.ttft_us,
            itl_ms: m.itl_us / 1000.0,
            e2e_latency_us: m.e2e_latency_us,
            scheduling_delay_ms: m.scheduling_delay_us as f64 / 1000.0,
            preemption_count: m.preemption_count,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Percentiles {
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

fn percentiles(mut values: Vec<f64>) -> Percentiles {
    if values.is_empty() {
        return Percentiles {
            mean: 0.0,
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
        };
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let at = |p: f64| -> f64 {
        let idx = ((values.len() - 1) as f64 * p).round() as usize;
        values[idx.min(values.len() - 1)]
    };
    Percentiles {
        mean,
        p50: at(0.50),
        p90: at(0.90),
        p99: at(0.99),
    }
}

/// Jain's fairness index over `values`: `(sum x)^2 / (n * sum x^2)`.
/// 1.0 when every value is equal, `1/n` in the maximally unfair case.
/// Applied here to per-instance completed-request counts, so a perfectly
/// balanced routing policy scores 1.0 and a skewed one scores lower.
fn jain_fairness_index(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let sum: f64 = values.iter().sum();
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    if sum_sq == 0.0 {
        return 1.0;
    }
    (sum * sum) / (values.len() as f64 * sum_sq)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregateSummary {
    pub completed_count: u64,
    pub ttft_us: Percentiles,
    pub itl_us: Percentiles,
    pub e2e_latency_us: Percentiles,
    pub scheduling_delay_us: Percentiles,
    pub jain_fairness_index: f64,
}

#[derive(Default)]
pub struct MetricsCollector {
    per_request: Vec<RequestMetric>,
    /// Completed-request count per instance. A `Vec` indexed by instance id
    /// rather than a hash map, so feeding it into float accumulation (Jain's
    /// index) never depends on hash iteration order.
    completions_by_instance: Vec<u64>,
}

impl MetricsCollector {
    pub fn new(num_instances: usize) -> Self {
        Self {
            per_request: Vec::new(),
            completions_by_instance: vec![0; num_instances],
        }
    }

    /// Records a just-completed request's timings. `rt` must already be in
    /// `RequestState::Completed` with all timestamps populated by
    /// `InstanceSimulator::step_tick`.
    pub fn record_completion(&mut self, rt: &RequestRuntime, instance_id: InstanceId) {
        let arrival = rt.request.arrival_time;
        let first_token = rt.first_token_at.unwrap_or(arrival);
        let completed = rt.completed_at.unwrap_or(first_token);
        let scheduled = rt.scheduled_at.unwrap_or(arrival);

        let mut token_times: Vec<Micros> = Vec::with_capacity(rt.decode_token_times.len() + 1);
        token_times.push(first_token);
        token_times.extend(rt.decode_token_times.iter().copied());
        let itl_us = if token_times.len() >= 2 {
            let mut gaps = Vec::with_capacity(token_times.len() - 1);
            for w in token_times.windows(2) {
                gaps.push((w[1] - w[0]) as f64);
            }
            gaps.iter().sum::<f64>() / gaps.len() as f64
        } else {
            0.0
        };

        self.per_request.push(RequestMetric {
            request_id: rt.id(),
            tenant_id: rt.request.tenant_id.clone(),
            instance_id,
            ttft_us: first_token - arrival,
            itl_us,
            e2e_latency_us: completed - arrival,
            scheduling_delay_us: scheduled - arrival,
            preemption_count: rt.preemption_count,
        });
        if instance_id < self.completions_by_instance.len() {
            self.completions_by_instance[instance_id] += 1;
        }
    }

    pub fn per_request(&self) -> &[RequestMetric] {
        &self.per_request
    }

    pub fn per_request_json(&self) -> Vec<RequestMetricJson> {
        self.per_request.iter().map(RequestMetricJson::from).collect()
    }

    pub fn completions_by_instance(&self) -> &[u64] {
        &self.completions_by_instance
    }

    pub fn aggregate(&self) -> AggregateSummary {
        let ttft: Vec<f64> = self.per_request.iter().map(|m| m.ttft_us as f64).collect();
        let itl: Vec<f64> = self.per_request.iter().map(|m| m.itl_us).collect();
        let e2e: Vec<f64> = self.per_request.iter().map(|m| m.e2e_latency_us as f64).collect();
        let sched: Vec<f64> = self
            .per_request
            .iter()
            .map(|m| m.scheduling_delay_us as f64)
            .collect();
        let fairness_input: Vec<f64> = self.completions_by_instance.iter().map(|&c| c as f64).collect();
        AggregateSummary {
            completed_count: self.per_request.len() as u64,
            ttft_us: percentiles(ttft),
            itl_us: percentiles(itl),
            e2e_latency_us: percentiles(e2e),
            scheduling_delay_us: percentiles(sched),
            jain_fairness_index: jain_fairness_index(&fairness_input),
        }
    }
}
