//! Paged per-instance KV block pool.
//!
//! Invariants maintained at all times:
//!   (a) the free list contains each block id at most once;
//!   (b) allocation + free set partitions the block universe exactly;
//!   (c) `freeRequest` followed by an identical re-allocation returns the
//!       same block ids, in the same order;
//!   (d) NaN/Inf tokens are rejected at the workload adapter, never seen
//!       here.

use blis_common::{hash_combine, BlisError, BlockId, Micros, RequestId, Result};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct CpuEntry {
    block_hash: u64,
    owner: RequestId,
    last_used: Micros,
}

/// Per-instance paged KV cache: a fixed-size GPU block pool plus a
/// capacity-bounded CPU offload tier.
pub struct KvCache {
    block_size_tokens: usize,
    total_gpu_blocks: usize,
    total_cpu_blocks: usize,
    /// Head = next block to allocate. `allocate_for_prefill` pops from the
    /// front; `free_request` pushes to the back in original allocation
    /// order, restoring the pre-allocation prefix exactly.
    free_list: VecDeque<BlockId>,
    /// Blocks currently held by each request, in allocation order.
    allocated: HashMap<RequestId, Vec<BlockId>>,
    /// Content hash of a block's logical prefix, once filled.
    block_hashes: HashMap<BlockId, u64>,
    /// Logical last-touch time per allocated block, used by `evict`.
    last_used: HashMap<BlockId, Micros>,
    /// Blocks offloaded to the CPU tier, keyed by block hash.
    cpu_tier: HashMap<u64, CpuEntry>,
    /// Requests whose blocks may not be evicted this tick (the current
    /// batch). Set by `InstanceSimulator` before attempting allocation.
    pinned: std::collections::HashSet<RequestId>,
}

impl KvCache {
    pub fn new(block_size_tokens: usize, total_gpu_blocks: usize, total_cpu_blocks: usize) -> Self {
        Self {
            block_size_tokens,
            total_gpu_blocks,
            total_cpu_blocks,
            free_list: (0..total_gpu_blocks as u64).collect(),
            allocated: HashMap::new(),
            block_hashes: HashMap::new(),
            last_used: HashMap::new(),
            cpu_tier: HashMap::new(),
            pinned: std::collections::HashSet::new(),
        }
    }

    pub fn block_size_tokens(&self) -> usize {
        self.block_size_tokens
    }

    pub fn total_gpu_blocks(&self) -> usize {
        self.total_gpu_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn used_blocks(&self) -> usize {
        self.total_gpu_blocks - self.free_list.len()
    }

    pub fn utilization(&self) -> f64 {
        if self.total_gpu_blocks == 0 {
            0.0
        } else {
            self.used_blocks() as f64 / self.total_gpu_blocks as f64
        }
    }

    pub fn cpu_tier_used(&self) -> usize {
        self.cpu_tier.len()
    }

    pub fn cpu_tier_capacity(&self) -> usize {
        self.total_cpu_blocks
    }

    pub fn mark_pinned(&mut self, requests: impl IntoIterator<Item = RequestId>) {
        self.pinned.clear();
        self.pinned.extend(requests);
    }

    /// Allocate `num_blocks` fresh blocks for `request` from the head of
    /// the free list, in order. If the pool is exhausted mid-allocation,
    /// every block allocated in *this call* is rolled back (pushed back to
    /// the head, in reverse, restoring head order) and `ErrOutOfBlocks` is
    /// returned.
    pub fn allocate_for_prefill(&mut self, request: RequestId, num_blocks: usize, now: Micros) -> Result<Vec<BlockId>> {
        let mut taken = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            match self.free_list.pop_front() {
                Some(block) => taken.push(block),
                None => {
                    // rollback: restore head order by pushing back in reverse
                    for block in taken.into_iter().rev() {
                        self.free_list.push_front(block);
                    }
                    return Err(BlisError::OutOfBlocks);
                }
            }
        }
        for &block in &taken {
            self.last_used.insert(block, now);
        }
        self.allocated.entry(request).or_default().extend(taken.iter().copied());
        Ok(taken)
    }

    /// Return all of `request`'s blocks to the tail of the free list, in
    /// their original allocation order — restoring the pre-allocation free
    /// list prefix exactly.
    pub fn free_request(&mut self, request: RequestId) {
        if let Some(blocks) = self.allocated.remove(&request) {
            for block in &blocks {
                self.block_hashes.remove(block);
                self.last_used.remove(block);
                self.free_list.push_back(*block);
            }
        }
        self.pinned.remove(&request);
    }

    pub fn blocks_of(&self, request: RequestId) -> &[BlockId] {
        self.allocated.get(&request).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn touch(&mut self, request: RequestId, now: Micros) {
        if let Some(blocks) = self.allocated.get(&request) {
            for block in blocks {
                self.last_used.insert(*block, now);
            }
        }
    }

    /// Evict the single least-recently-used block not pinned to the
    /// current batch, tie-broken by ascending block id. Returns the
    /// request that owned the evicted block (whose own allocation shrinks
    /// by one block) so the caller can update its bookkeeping, or `None` if
    /// no unpinned block exists.
    pub fn evict(&mut self) -> Option<(RequestId, BlockId, Option<u64>)> {
        let mut victim: Option<(RequestId, BlockId, Micros)> = None;
        for (&req, blocks) in &self.allocated {
            if self.pinned.contains(&req) {
                continue;
            }
            for &block in blocks {
                let t = *self.last_used.get(&block).unwrap_or(&Micros::MIN);
                let better = match victim {
                    None => true,
                    Some((_, best_block, best_t)) => (t, block) < (best_t, best_block),
                };
                if better {
                    victim = Some((req, block, t));
                }
            }
        }
        let (req, block, _) = victim?;
        if let Some(blocks) = self.allocated.get_mut(&req) {
            blocks.retain(|&b| b != block);
            if blocks.is_empty() {
                self.allocated.remove(&req);
            }
        }
        let hash = self.block_hashes.remove(&block);
        self.last_used.remove(&block);
        self.free_list.push_back(block);
        Some((req, block, hash))
    }

    /// Offload up to `max_blocks` of `request`'s coldest decode-only
    /// blocks (i.e. beyond its prefill footprint) to the CPU tier, when
    /// GPU usage ratio is at or above `threshold`. Strips their content
    /// hashes from the in-flight index. Returns the block hashes moved, so
    /// the caller (`ClusterSimulator`) can evict matching entries from the
    /// global `PrefixCacheIndex`.
    pub fn maybe_offload(
        &mut self,
        request: RequestId,
        prefill_block_count: usize,
        threshold: f64,
        max_blocks: usize,
    ) -> Vec<(BlockId, u64)> {
        if self.utilization() < threshold {
            return Vec::new();
        }
        let blocks = self.allocated.get(&request).cloned().unwrap_or_default();
        if blocks.len() <= prefill_block_count {
            return Vec::new();
        }
        let mut decode_blocks: Vec<BlockId> = blocks[prefill_block_count..].to_vec();
        decode_blocks.sort_by_key(|b| (*self.last_used.get(b).unwrap_or(&Micros::MIN), *b));

        let mut moved = Vec::new();
        for block in decode_blocks {
            if moved.len() >= max_blocks {
                break;
            }
            if self.cpu_tier.len() >= self.total_cpu_blocks {
                break;
            }
            let Some(hash) = self.block_hashes.remove(&block) else {
                continue;
            };
            self.cpu_tier.insert(
                hash,
                CpuEntry {
                    block_hash: hash,
                    owner: request,
                    last_used: *self.last_used.get(&block).unwrap_or(&0),
                },
            );
            if let Some(bs) = self.allocated.get_mut(&request) {
                bs.retain(|&b| b != block);
            }
            self.last_used.remove(&block);
            self.free_list.push_back(block);
            moved.push((block, hash));
        }
        moved
    }

    /// Latency cost of reloading `num_blocks` worth of offloaded content
    /// from the CPU tier at `bandwidth_bytes_per_sec`, modeled as a
    /// blocking transfer added to the step that re-activates the request
    /// (see DESIGN.md: not overlapped with decode compute).
    pub fn reload_latency_us(&self, num_blocks: usize, bytes_per_block: f64, bandwidth_bytes_per_sec: f64) -> Micros {
        if bandwidth_bytes_per_sec <= 0.0 {
            return 0;
        }
        let seconds = (num_blocks as f64 * bytes_per_block) / bandwidth_bytes_per_sec;
        (seconds * 1e6).round() as Micros
    }

    /// Canonical content hash of a full block's tokens. Undefined (panics
    /// in debug, best-effort in release) for a partial block — callers
    /// must only call this once a block's logical window is completely
    /// filled.
    pub fn block_hash(&self, tokens: &[u32]) -> u64 {
        debug_assert_eq!(
            tokens.len(),
            self.block_size_tokens,
            "block_hash is undefined for a partial block"
        );
        let bytes: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
        hash_combine(&[&bytes])
    }

    pub fn record_block_hash(&mut self, block: BlockId, hash: u64) {
        self.block_hashes.insert(block, hash);
    }

    pub fn block_hash_of(&self, block: BlockId) -> Option<u64> {
        self.block_hashes.get(&block).copied()
    }

    pub fn cpu_tier_contains(&self, hash: u64) -> bool {
        self.cpu_tier.contains_key(&hash)
    }

    /// Reload `hashes` (all of which must currently sit in the CPU tier)
    /// back onto fresh GPU blocks for `request`. All-or-nothing: if the
    /// free list can't satisfy every hash, nothing is reloaded and
    /// `ErrOutOfBlocks` is returned, so a partial reload never leaves a
    /// request with some blocks live and others still offloaded.
    pub fn reload_blocks(&mut self, request: RequestId, hashes: &[u64], now: Micros) -> Result<Vec<BlockId>> {
        let mut taken = Vec::with_capacity(hashes.len());
        for _ in hashes {
            match self.free_list.pop_front() {
                Some(block) => taken.push(block),
                None => {
                    for block in taken.into_iter().rev() {
                        self.free_list.push_front(block);
                    }
                    return Err(BlisError::OutOfBlocks);
                }
            }
        }
        for (&block, &hash) in taken.iter().zip(hashes.iter()) {
            self.last_used.insert(block, now);
            self.block_hashes.insert(block, hash);
            self.cpu_tier.remove(&hash);
        }
        self.allocated.entry(request).or_default().extend(taken.iter().copied());
        Ok(taken)
    }

    /// Invariant check: `free + allocated == total`. Debug-only assertion
    /// surface, exercised directly in tests and from `ClusterSimulator`'s
    /// per-tick conservation check.
    pub fn check_invariants(&self) -> Result<()> {
        let allocated_count: usize = self.allocated.values().map(Vec::len).sum();
        if self.free_list.len() + allocated_count != self.total_gpu_blocks {
            return Err(BlisError::Validation(format!(
                "KV invariant violated: free={} allocated={} total={}",
                self.free_list.len(),
                allocated_count,
                self.total_gpu_blocks
            )));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.free_list.len());
        for &b in &self.free_list {
            if !seen.insert(b) {
                return Err(BlisError::Validation(format!(
                    "KV invariant violated: block {b} appears twice in free list"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_restores_head_identity() {
        let mut kv = KvCache::new(16, 10, 0);
        let first = kv.allocate_for_prefill(1, 3, 0).unwrap();
        kv.free_request(1);
        let second = kv.allocate_for_prefill(1, 3, 0).unwrap();
        assert_eq!(first, second);
        kv.check_invariants().unwrap();
    }

    #[test]
    fn allocation_failure_rolls_back_and_preserves_head() {
        let mut kv = KvCache::new(16, 4, 0);
        let before: Vec<_> = kv.free_list.iter().copied().collect();
        let err = kv.allocate_for_prefill(1, 10, 0).unwrap_err();
        assert!(matches!(err, BlisError::OutOfBlocks));
        let after: Vec<_> = kv.free_list.iter().copied().collect();
        assert_eq!(before, after);
        kv.check_invariants().unwrap();
    }

    #[test]
    fn free_list_has_no_duplicates_after_multiple_requests() {
        let mut kv = KvCache::new(16, 8, 0);
        kv.allocate_for_prefill(1, 3, 0).unwrap();
        kv.allocate_for_prefill(2, 3, 0).unwrap();
        kv.free_request(1);
        kv.allocate_for_prefill(3, 2, 0).unwrap();
        kv.check_invariants().unwrap();
    }

    #[test]
    fn evict_skips_pinned_requests() {
        let mut kv = KvCache::new(16, 4, 0);
        kv.allocate_for_prefill(1, 2, 0).unwrap();
        kv.allocate_for_prefill(2, 2, 5).unwrap();
        kv.mark_pinned([1]);
        let victim = kv.evict().unwrap();
        assert_eq!(victim.0, 2);
        assert_eq!(victim.2, None);
    }

    #[test]
    fn evict_returns_none_when_everything_pinned() {
        let mut kv = KvCache::new(16, 4, 0);
        kv.allocate_for_prefill(1, 2, 0).unwrap();
        kv.mark_pinned([1]);
        assert!(kv.evict().is_none());
    }

    #[test]
    fn maybe_offload_respects_threshold() {
        let mut kv = KvCache::new(16, 4, 4);
        kv.allocate_for_prefill(1, 4, 0).unwrap();
        for (i, &b) in kv.blocks_of(1).to_vec().iter().enumerate() {
            kv.record_block_hash(b, i as u64);
        }
        // utilization is 100%, threshold 0.5 should trigger
        let moved = kv.maybe_offload(1, 1, 0.5, 2);
        assert!(!moved.is_empty());
        kv.check_invariants().unwrap();
    }

    #[test]
    fn evict_surfaces_the_victim_blocks_recorded_hash() {
        let mut kv = KvCache::new(16, 2, 0);
        let blocks = kv.allocate_for_prefill(1, 2, 0).unwrap();
        kv.record_block_hash(blocks[0], 777);
        let victim = kv.evict().unwrap();
        assert_eq!(victim.1, blocks[0]);
        assert_eq!(victim.2, Some(777));
        assert_eq!(kv.block_hash_of(blocks[0]), None);
    }

    #[test]
    fn reload_blocks_restores_hashes_and_clears_cpu_tier() {
        let mut kv = KvCache::new(16, 4, 4);
        kv.allocate_for_prefill(1, 4, 0).unwrap();
        for (i, &b) in kv.blocks_of(1).to_vec().iter().enumerate() {
            kv.record_block_hash(b, 1000 + i as u64);
        }
        let moved = kv.maybe_offload(1, 1, 0.5, 2);
        assert!(!moved.is_empty());
        let hashes: Vec<u64> = moved.iter().map(|(_, h)| *h).collect();
        for h in &hashes {
            assert!(kv.cpu_tier_contains(*h));
        }
        let reloaded = kv.reload_blocks(1, &hashes, 10).unwrap();
        assert_eq!(reloaded.len(), hashes.len());
        for (&block, &hash) in reloaded.iter().zip(hashes.iter()) {
            assert_eq!(kv.block_hash_of(block), Some(hash));
            assert!(!kv.cpu_tier_contains(hash));
        }
        kv.check_invariants().unwrap();
    }

    #[test]
    fn reload_blocks_fails_atomically_when_pool_exhausted() {
        let mut kv = KvCache::new(16, 2, 4);
        kv.allocate_for_prefill(1, 2, 0).unwrap();
        // nothing free: reload must fail without partially consuming the pool
        let err = kv.reload_blocks(1, &[1, 2], 0).unwrap_err();
        assert!(matches!(err, BlisError::OutOfBlocks));
        assert_eq!(kv.free_blocks(), 0);
        kv.check_invariants().unwrap();
    }

    #[test]
    fn block_hash_is_deterministic() {
        let kv = KvCache::new(4, 10, 0);
        let toks = vec![1u32, 2, 3, 4];
        assert_eq!(kv.block_hash(&toks), kv.block_hash(&toks));
    }
}
