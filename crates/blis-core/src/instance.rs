//! Per-instance batch formation, KV allocation escalation, and step tick.
//! One `InstanceSimulator` per worker; owned and driven exclusively by
//! `ClusterSimulator`.
//!
//! The escalation ladder on an allocation failure is, in order: opportunistic
//! LRU eviction (almost always a no-op — the whole current-tick batch is
//! pinned, see `KvCache::mark_pinned`), CPU offload of a running peer's cold
//! decode blocks, then outright preemption of the lowest-priority running
//! request (reverse priority order, later-arrival-first tie-break).

use crate::kv::KvCache;
use crate::request::{RequestRuntime, RequestState, SloClass};
use blis_common::{BlockId, InstanceId, Micros, RequestId, Result};
use blis_latency::{LatencyModel, StepConfig};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Fcfs,
    PriorityFcfs,
}

impl SchedulerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fcfs" => Some(SchedulerKind::Fcfs),
            "priority-fcfs" => Some(SchedulerKind::PriorityFcfs),
            _ => None,
        }
    }
}

/// Selects how `priority_rank` weighs `SloClass` (`--priority-policy`).
/// `Constant` collapses every class to the same rank, so `priority-fcfs`
/// degenerates to plain arrival order; `SloBased` ranks interactive ahead
/// of batch traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicy {
    Constant,
    SloBased,
}

impl PriorityPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "constant" => Some(PriorityPolicy::Constant),
            "slo-based" => Some(PriorityPolicy::SloBased),
            _ => None,
        }
    }
}

fn priority_rank(policy: PriorityPolicy, slo: SloClass) -> u8 {
    match policy {
        PriorityPolicy::Constant => 0,
        PriorityPolicy::SloBased => match slo {
            SloClass::Interactive => 0,
            SloClass::Standard => 1,
            SloClass::Batch => 2,
        },
    }
}

/// A block that was just given a content hash this tick, surfaced so
/// `ClusterSimulator` can mirror the assignment into the global
/// `PrefixCacheIndex`.
#[derive(Debug, Clone, Copy)]
pub struct BlockHashEvent {
    pub block: BlockId,
    pub hash: u64,
}

#[derive(Debug, Default)]
struct GrowthSideEffects {
    newly_hashed: Vec<BlockHashEvent>,
    preempted: Vec<RequestId>,
    invalidated: Vec<u64>,
    /// Blocking CPU-tier reload cost accrued this tick, added to
    /// `step_time_us` once the whole batch has been formed.
    reload_latency_us: Micros,
    /// Waiting requests whose very next growth step would need more blocks
    /// than this instance's entire GPU budget — no escalation will ever
    /// free enough capacity, so they are rejected rather than retried.
    rejected: Vec<RequestRuntime>,
}

pub struct StepOutcome {
    pub step_time_us: Micros,
    pub admitted: Vec<RequestId>,
    pub preempted: Vec<RequestId>,
    pub completed: Vec<RequestRuntime>,
    /// Waiting requests that can never fit on this instance regardless of
    /// eviction/offload/preemption (their next growth step alone exceeds
    /// `total_gpu_blocks`). `ClusterSimulator` counts these as rejections.
    pub rejected: Vec<RequestRuntime>,
    pub newly_hashed_blocks: Vec<BlockHashEvent>,
    /// Global-index entries (evicted, offloaded, or freed-on-completion)
    /// that `ClusterSimulator` must remove from its `PrefixCacheIndex`.
    pub invalidated_block_hashes: Vec<u64>,
    pub still_has_work: bool,
}

/// Outcome of `secure_blocks`'s escalation ladder for a single growth
/// request; folded into the caller's `GrowthSideEffects` on success.
struct Escalation {
    blocks: Vec<BlockId>,
    invalidated_hashes: Vec<u64>,
    preempted: Vec<RequestId>,
}

pub struct InstanceSimulator {
    id: InstanceId,
    scheduler: SchedulerKind,
    priority_policy: PriorityPolicy,
    max_batch_size: usize,
    long_prefill_token_threshold: usize,
    kv_offload_threshold: f64,
    kv_offload_max_blocks_per_tick: usize,
    kv_transfer_bandwidth_bytes_per_sec: f64,
    kv_bytes_per_block: f64,
    kv: KvCache,
    waiting: VecDeque<RequestRuntime>,
    running: Vec<RequestRuntime>,
}

impl InstanceSimulator {
    /// Block size threads in from construction, not a global.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: InstanceId,
        block_size_tokens: usize,
        total_gpu_blocks: usize,
        total_cpu_blocks: usize,
        scheduler: SchedulerKind,
        priority_policy: PriorityPolicy,
        max_batch_size: usize,
        long_prefill_token_threshold: usize,
        kv_offload_threshold: f64,
        kv_offload_max_blocks_per_tick: usize,
        kv_transfer_bandwidth_bytes_per_sec: f64,
        kv_bytes_per_block: f64,
    ) -> Self {
        Self {
            id,
            scheduler,
            priority_policy,
            max_batch_size,
            long_prefill_token_threshold,
            kv_offload_threshold,
            kv_offload_max_blocks_per_tick,
            kv_transfer_bandwidth_bytes_per_sec,
            kv_bytes_per_block,
            kv: KvCache::new(block_size_tokens, total_gpu_blocks, total_cpu_blocks),
            waiting: VecDeque::new(),
            running: Vec::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn queue_depth(&self) -> usize {
        self.waiting.len()
    }

    pub fn batch_size(&self) -> usize {
        self.running.len()
    }

    pub fn kv_utilization(&self) -> f64 {
        self.kv.utilization()
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv
    }

    /// Place a newly routed request at the tail of the waiting queue
    /// (`fcfs`) or in priority order (`priority-fcfs`, ties broken by
    /// insertion/arrival order since a stable insertion point is used).
    pub fn enqueue(&mut self, mut rt: RequestRuntime) {
        rt.state = RequestState::Queued;
        self.insert_waiting(rt);
    }

    fn insert_waiting(&mut self, rt: RequestRuntime) {
        match self.scheduler {
            SchedulerKind::Fcfs => self.waiting.push_back(rt),
            SchedulerKind::PriorityFcfs => {
                let rank = priority_rank(self.priority_policy, rt.request.slo_class);
                let pos = self
                    .waiting
                    .iter()
                    .position(|other| priority_rank(self.priority_policy, other.request.slo_class) > rank)
                    .unwrap_or(self.waiting.len());
                self.waiting.insert(pos, rt);
            }
        }
    }

    fn blocks_required_for_tokens(&self, tokens: usize) -> usize {
        let bs = self.kv.block_size_tokens();
        if bs == 0 {
            0
        } else {
            (tokens + bs - 1) / bs
        }
    }

    fn prefill_chunk_size(&self, rt: &RequestRuntime) -> usize {
        let remaining = rt.remaining_prefill_tokens();
        if self.long_prefill_token_threshold == 0 {
            remaining
        } else {
            remaining.min(self.long_prefill_token_threshold)
        }
    }

    /// Blocks `rt` would need to hold after its very next growth step
    /// (prefill chunk or single decode token), ignoring blocks it already
    /// holds — `waiting` members always hold none, see `requeue_preempted`.
    /// Used only to detect permanently-unfittable requests; `try_grow` does
    /// the real (mutating) allocation.
    fn minimum_blocks_needed(&self, rt: &RequestRuntime) -> usize {
        let amount = if rt.is_prefilling() {
            self.prefill_chunk_size(rt)
        } else {
            1
        };
        self.blocks_required_for_tokens(rt.progress + amount)
    }

    /// Escalation ladder: opportunistic evict, then peer offload, then
    /// preemption, retried until `delta` additional blocks are secured or no
    /// further victim exists. `max_attempts` bounds what should already be a
    /// strictly-converging loop (each step either allocates or frees at
    /// least one block) against a latent bug turning it into a spin.
    fn secure_blocks(&mut self, request_id: RequestId, delta: usize, now: Micros) -> Option<Escalation> {
        if delta == 0 {
            return Some(Escalation {
                blocks: Vec::new(),
                invalidated_hashes: Vec::new(),
                preempted: Vec::new(),
            });
        }
        let mut invalidated = Vec::new();
        let mut preempted = Vec::new();
        let max_attempts = self.kv.total_gpu_blocks() + self.running.len() + 2;
        for _ in 0..max_attempts {
            match self.kv.allocate_for_prefill(request_id, delta, now) {
                Ok(blocks) => {
                    return Some(Escalation {
                        blocks,
                        invalidated_hashes: invalidated,
                        preempted,
                    });
                }
                Err(_) => {
                    if let Some((_, _, hash)) = self.kv.evict() {
                        if let Some(h) = hash {
                            invalidated.push(h);
                        }
                        continue;
                    }
                    if self.try_offload_someone(&mut invalidated) {
                        continue;
                    }
                    if let Some(victim) = self.preempt_one(&mut invalidated) {
                        preempted.push(victim);
                        continue;
                    }
                    return None;
                }
            }
        }
        None
    }

    fn try_offload_someone(&mut self, invalidated: &mut Vec<u64>) -> bool {
        let mut ids: Vec<RequestId> = self.running.iter().map(|r| r.id()).collect();
        ids.sort_unstable();
        for id in ids {
            let prefill_blocks = self
                .running
                .iter()
                .find(|r| r.id() == id)
                .map(|r| self.blocks_required_for_tokens(r.request.input_tokens))
                .unwrap_or(0);
            let moved = self.kv.maybe_offload(
                id,
                prefill_blocks,
                self.kv_offload_threshold,
                self.kv_offload_max_blocks_per_tick,
            );
            if !moved.is_empty() {
                let moved_blocks: Vec<BlockId> = moved.iter().map(|(b, _)| *b).collect();
                let moved_hashes: Vec<u64> = moved.iter().map(|(_, h)| *h).collect();
                if let Some(peer) = self.running.iter_mut().find(|r| r.id() == id) {
                    peer.kv_blocks.retain(|b| !moved_blocks.contains(b));
                    peer.offloaded_block_hashes.extend(moved_hashes.iter().copied());
                }
                invalidated.extend(moved_hashes);
                return true;
            }
        }
        false
    }

    /// Demotes the running request with the worst priority, tie-broken by
    /// later arrival time: `max_by_key` on `(priorityRank, arrivalTime, id)`
    /// picks exactly that request.
    fn preempt_one(&mut self, invalidated: &mut Vec<u64>) -> Option<RequestId> {
        let idx = self
            .running
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| {
                (
                    priority_rank(self.priority_policy, r.request.slo_class),
                    r.request.arrival_time,
                    r.id(),
                )
            })
            .map(|(i, _)| i)?;
        let victim = self.running.remove(idx);
        let victim_id = victim.id();
        for &block in self.kv.blocks_of(victim_id) {
            if let Some(h) = self.kv.block_hash_of(block) {
                invalidated.push(h);
            }
        }
        self.kv.free_request(victim_id);
        self.requeue_preempted(victim);
        Some(victim_id)
    }

    fn requeue_preempted(&mut self, mut rt: RequestRuntime) {
        rt.state = RequestState::Preempted;
        rt.preemption_count += 1;
        rt.kv_blocks.clear();
        self.insert_waiting(rt);
    }

    /// Attempts to grow `rt` by one unit of work this tick (its prefill
    /// chunk, or one decode token), securing whatever additional KV blocks
    /// that requires. Returns `rt` and the amount advanced, or `None` if no
    /// blocks could be secured — the request simply does not progress this
    /// tick and is retried on the next `InstanceStep`.
    fn try_grow(&mut self, mut rt: RequestRuntime, now: Micros, effects: &mut GrowthSideEffects) -> (RequestRuntime, Option<usize>) {
        if rt.is_complete() {
            return (rt, None);
        }
        if !rt.offloaded_block_hashes.is_empty() {
            match self.kv.reload_blocks(rt.id(), &rt.offloaded_block_hashes, now) {
                Ok(blocks) => {
                    effects.reload_latency_us += self.kv.reload_latency_us(
                        blocks.len(),
                        self.kv_bytes_per_block,
                        self.kv_transfer_bandwidth_bytes_per_sec,
                    );
                    for (&block, &hash) in blocks.iter().zip(rt.offloaded_block_hashes.iter()) {
                        effects.newly_hashed.push(BlockHashEvent { block, hash });
                    }
                    rt.kv_blocks.extend(blocks);
                    rt.offloaded_block_hashes.clear();
                }
                Err(_) => return (rt, None),
            }
        }
        let amount = if rt.is_prefilling() {
            self.prefill_chunk_size(&rt)
        } else {
            1
        };
        if amount == 0 {
            return (rt, None);
        }
        let tokens_after = rt.progress + amount;
        let need = self.blocks_required_for_tokens(tokens_after);
        let delta = need.saturating_sub(rt.kv_blocks.len());
        match self.secure_blocks(rt.id(), delta, now) {
            Some(esc) => {
                let offset = rt.kv_blocks.len();
                rt.kv_blocks.extend(esc.blocks.iter().copied());
                for (i, &block) in esc.blocks.iter().enumerate() {
                    if let Some(&hash) = rt.block_hashes.get(offset + i) {
                        self.kv.record_block_hash(block, hash);
                        effects.newly_hashed.push(BlockHashEvent { block, hash });
                    }
                }
                effects.preempted.extend(esc.preempted);
                effects.invalidated.extend(esc.invalidated_hashes);
                (rt, Some(amount))
            }
            None => (rt, None),
        }
    }

    /// Forms and executes the next step batch:
    /// 1. Grow every already-running request by its unit of work this tick.
    /// 2. Admit new requests from the head of `waiting`, subject to the
    ///    batch-size cap, stopping (not skipping) at the first one that
    ///    cannot secure blocks even after escalation — unless that request
    ///    can never fit regardless of escalation, in which case it is
    ///    rejected outright and the next waiting request is tried instead.
    /// 3. Emit the resulting `StepConfig` to the latency model.
    /// 4. Apply the advance, completing requests whose progress now equals
    ///    `input + output` exactly, freeing their blocks in allocation
    ///    order.
    pub fn step_tick(&mut self, now: Micros, latency: &dyn LatencyModel) -> Result<StepOutcome> {
        let pinned_snapshot: Vec<RequestId> = self.running.iter().map(|r| r.id()).collect();
        self.kv.mark_pinned(pinned_snapshot);

        let mut effects = GrowthSideEffects::default();
        let mut advance_amount: HashMap<RequestId, usize> = HashMap::new();
        let mut admitted = Vec::new();

        let mut continuing_ids: Vec<RequestId> = self.running.iter().map(|r| r.id()).collect();
        continuing_ids.sort_unstable();
        for id in continuing_ids {
            let idx = match self.running.iter().position(|r| r.id() == id) {
                Some(i) => i,
                None => continue, // preempted earlier this tick by a peer's escalation
            };
            let rt = self.running.remove(idx);
            let (rt, amount) = self.try_grow(rt, now, &mut effects);
            if let Some(a) = amount {
                advance_amount.insert(rt.id(), a);
            }
            self.running.push(rt);
        }

        while self.running.len() < self.max_batch_size {
            let Some(rt) = self.waiting.pop_front() else { break };
            let (mut rt, amount) = self.try_grow(rt, now, &mut effects);
            match amount {
                Some(a) => {
                    rt.state = RequestState::Running;
                    if rt.scheduled_at.is_none() {
                        rt.scheduled_at = Some(now);
                    }
                    advance_amount.insert(rt.id(), a);
                    admitted.push(rt.id());
                    self.running.push(rt);
                }
                None => {
                    // A request whose next growth step alone needs more
                    // blocks than the instance's entire GPU budget will
                    // never be admitted no matter how much eviction,
                    // offload, or preemption runs on its behalf — retrying
                    // it every tick would pin the batch at zero progress
                    // and spin the clock at the same timestamp forever.
                    if self.minimum_blocks_needed(&rt) > self.kv.total_gpu_blocks() {
                        let mut rt = rt;
                        rt.state = RequestState::Rejected;
                        effects.rejected.push(rt);
                        continue;
                    }
                    self.waiting.push_front(rt);
                    break;
                }
            }
        }

        let mut order: Vec<RequestId> = advance_amount.keys().copied().collect();
        order.sort_unstable();
        // A request grown in the continuing phase can still be preempted by
        // a later admission's escalation this same tick; it no longer
        // participates in this step once that happens.
        order.retain(|id| self.running.iter().any(|r| r.id() == *id));

        let mut prefill_token_counts = Vec::new();
        let mut decode_kv_lengths = Vec::new();
        for id in &order {
            let rt = self
                .running
                .iter()
                .find(|r| r.id() == *id)
                .expect("an advancing request must be in the running batch");
            if rt.is_prefilling() {
                prefill_token_counts.push(advance_amount[id]);
            } else {
                decode_kv_lengths.push(rt.progress);
            }
        }
        let step = StepConfig {
            prefill_token_counts,
            decode_kv_lengths,
        };
        // CPU-tier reload is modeled as a blocking transfer added to the
        // step that re-activates the request, not overlapped with compute.
        let step_time_us = latency.step_time(&step)? + effects.reload_latency_us;

        let mut completed = Vec::new();
        for id in &order {
            let idx = self
                .running
                .iter()
                .position(|r| r.id() == *id)
                .expect("an advancing request must be in the running batch");
            let mut rt = self.running.remove(idx);
            let amount = advance_amount[id];
            let was_prefilling = rt.is_prefilling();
            rt.progress += amount;
            let finish_time = now + step_time_us;
            if was_prefilling && !rt.is_prefilling() {
                rt.first_token_at = Some(finish_time);
            }
            if !was_prefilling {
                rt.decode_token_times.push(finish_time);
            }
            if rt.is_complete() {
                rt.state = RequestState::Completed;
                rt.completed_at = Some(finish_time);
                for &block in self.kv.blocks_of(rt.id()) {
                    if let Some(h) = self.kv.block_hash_of(block) {
                        effects.invalidated.push(h);
                    }
                }
                self.kv.free_request(rt.id());
                rt.kv_blocks.clear();
                completed.push(rt);
            } else {
                self.running.push(rt);
            }
        }

        let still_has_work = !self.running.is_empty() || !self.waiting.is_empty();
        Ok(StepOutcome {
            step_time_us,
            admitted,
            preempted: effects.preempted,
            completed,
            rejected: effects.rejected,
            newly_hashed_blocks: effects.newly_hashed,
            invalidated_block_hashes: effects.invalidated,
            still_has_work,
        })
    }
}
