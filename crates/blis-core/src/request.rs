//! Request data model and its lifecycle state machine.

use blis_common::{InstanceId, Micros, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloClass {
    Interactive,
    Standard,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextGrowth {
    Accumulate,
    Truncate,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct MultiTurnDescriptor {
    pub max_rounds: u32,
    pub think_time_us: Micros,
    pub context_growth: ContextGrowth,
}

/// Immutable attributes of a request, as emitted by `WorkloadSource`. Once
/// created, only `progress` (owned by whichever component currently holds
/// the request) changes; everything else is fixed at arrival.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub arrival_time: Micros,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub tenant_id: String,
    pub slo_class: SloClass,
    pub prefix_group: Option<String>,
    pub prefix_length: Option<usize>,
    pub streaming: bool,
    pub multi_turn: Option<MultiTurnDescriptor>,
    /// Which turn of a multi-turn conversation this is, 0 for the first.
    /// Each follow-up turn is a distinct `Request` with its own id; `round`
    /// is what lets the conversation know when it has hit `max_rounds`.
    pub round: u32,
}

impl Request {
    /// Total tokens this request will ever consume: prefill + decode.
    pub fn total_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    /// Whether this conversation should re-arrive for another turn once
    /// this request completes.
    pub fn has_next_round(&self) -> bool {
        self.multi_turn
            .as_ref()
            .is_some_and(|m| self.round + 1 < m.max_rounds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Arrived,
    Admitted,
    Queued,
    Running,
    Preempted,
    Completed,
    Rejected,
}

/// Mutable per-request runtime bookkeeping, owned by whichever component
/// currently has the request in its state (WorkloadSource/ClusterSimulator
/// before routing, InstanceSimulator afterward).
#[derive(Debug, Clone)]
pub struct RequestRuntime {
    pub request: Request,
    pub state: RequestState,
    pub assigned_instance: Option<InstanceId>,
    /// prefill tokens consumed + decode tokens emitted so far.
    pub progress: usize,
    pub kv_blocks: Vec<blis_common::BlockId>,
    /// Pre-computed content hash of each logical block this request will
    /// ever occupy (index = logical block index), populated once at
    /// arrival by `ClusterSimulator` via `prefix_index::request_block_hashes`
    /// so routing's prefix-affinity scorer and later KV allocation agree on
    /// the same values.
    pub block_hashes: Vec<u64>,
    /// Hashes of this request's decode blocks currently sitting in the CPU
    /// offload tier, most-recently-offloaded last. Drained (and charged a
    /// reload latency) by `InstanceSimulator` the next time this request
    /// grows and needs GPU-resident KV again.
    pub offloaded_block_hashes: Vec<u64>,
    pub admitted_at: Option<Micros>,
    pub scheduled_at: Option<Micros>,
    pub first_token_at: Option<Micros>,
    pub completed_at: Option<Micros>,
    /// timestamps of every decode-token emission, used to compute ITL.
    pub decode_token_times: Vec<Micros>,
    pub preemption_count: u32,
}

impl RequestRuntime {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            state: RequestState::Arrived,
            assigned_instance: None,
            progress: 0,
            kv_blocks: Vec::new(),
            block_hashes: Vec::new(),
            offloaded_block_hashes: Vec::new(),
            admitted_at: None,
            scheduled_at: None,
            first_token_at: None,
            completed_at: None,
            decode_token_times: Vec::new(),
            preemption_count: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }

    pub fn is_prefilling(&self) -> bool {
        self.progress < self.request.input_tokens
    }

    pub fn remaining_prefill_tokens(&self) -> usize {
        self.request.input_tokens.saturating_sub(self.progress)
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= self.request.total_tokens()
    }

    pub fn kv_length(&self) -> usize {
        self.progress
    }
}
