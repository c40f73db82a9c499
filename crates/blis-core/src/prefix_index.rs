//! Cluster-owned prefix cache index.
//!
//! `blockHash -> {instanceId, lastUsed}`, LRU-evicted, tie-broken by block
//! hash ascending when `lastUsed` is equal. Owned and mutated only by
//! `ClusterSimulator` during routing — instances never touch it directly,
//! avoiding cyclic ownership: instances only ever see an opaque
//! `InstanceId`, never a back-pointer into the cluster.

use blis_common::{hash_combine, InstanceId, Micros};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub struct PrefixEntry {
    pub instance_id: InstanceId,
    pub last_used: Micros,
}

pub struct PrefixCacheIndex {
    capacity: usize,
    entries: BTreeMap<u64, PrefixEntry>,
}

impl PrefixCacheIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, block_hash: u64) -> Option<&PrefixEntry> {
        self.entries.get(&block_hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `instance_id` now holds `block_hash`, evicting the
    /// global least-recently-used entry (by sorted key order) if capacity
    /// is exceeded.
    pub fn record(&mut self, block_hash: u64, instance_id: InstanceId, now: Micros) {
        self.entries.insert(
            block_hash,
            PrefixEntry {
                instance_id,
                last_used: now,
            },
        );
        while self.entries.len() > self.capacity {
            self.evict_lru();
        }
    }

    pub fn remove(&mut self, block_hash: u64) {
        self.entries.remove(&block_hash);
    }

    /// Iterates entries in sorted key order to find the least-recently-used
    /// entry, tie-breaking by block hash ascending — which sorted-key
    /// iteration gives for free.
    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(&hash, entry)| (entry.last_used, hash))
            .map(|(&hash, _)| hash);
        if let Some(hash) = victim {
            self.entries.remove(&hash);
        }
    }

    /// Count of `request_hashes` that already have an entry in this index,
    /// per candidate instance — used by the `prefix-affinity` scorer.
    pub fn matching_blocks(&self, request_hashes: &[u64], instance_id: InstanceId) -> usize {
        request_hashes
            .iter()
            .filter(|h| {
                self.entries
                    .get(h)
                    .map(|e| e.instance_id == instance_id)
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Free function computing a request's own block-aligned prefix hashes,
/// using the same content-hash function `KvCache::block_hash` uses. A pure
/// function of the tokens and block size, so no `PrefixCacheIndex` instance
/// is needed just to hash a candidate request.
pub fn compute_prefix_hashes(tokens: &[u32], block_size_tokens: usize) -> Vec<u64> {
    if block_size_tokens == 0 {
        return Vec::new();
    }
    tokens
        .chunks_exact(block_size_tokens)
        .map(|chunk| {
            let bytes: Vec<u8> = chunk.iter().flat_map(|t| t.to_le_bytes()).collect();
            hash_combine(&[&bytes])
        })
        .collect()
}

/// Derives a request's full, block-aligned content hashes without a literal
/// token array (the data model only carries token *counts*). Tokens
/// within the shared prefix span are synthesized from `prefix_group` alone
/// so two requests with the same group and prefix length land on identical
/// block hashes — the mechanism prefix-affinity routing and cache-hit
/// behavior both depend on. Tokens past the shared span are synthesized
/// from `request_id` and are therefore unique to this request.
pub fn request_block_hashes(
    request_id: blis_common::RequestId,
    prefix_group: Option<&str>,
    prefix_length: Option<usize>,
    total_tokens: usize,
    block_size_tokens: usize,
) -> Vec<u64> {
    if block_size_tokens == 0 || total_tokens == 0 {
        return Vec::new();
    }
    let shared_len = prefix_length.unwrap_or(0).min(total_tokens);
    let mut tokens = Vec::with_capacity(total_tokens);
    for pos in 0..shared_len {
        let synthetic = match prefix_group {
            Some(group) => hash_combine(&[group.as_bytes(), &(pos as u64).to_le_bytes()]),
            None => hash_combine(&[&request_id.to_le_bytes(), &(pos as u64).to_le_bytes()]),
        };
        tokens.push((synthetic & 0xFFFF_FFFF) as u32);
    }
    for pos in shared_len..total_tokens {
        let synthetic = hash_combine(&[&request_id.to_le_bytes(), &(pos as u64).to_le_bytes()]);
        tokens.push((synthetic & 0xFFFF_FFFF) as u32);
    }
    compute_prefix_hashes(&tokens, block_size_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_eviction_respects_capacity() {
        let mut idx = PrefixCacheIndex::new(2);
        idx.record(1, 0, 10);
        idx.record(2, 0, 20);
        idx.record(3, 0, 30); // evicts hash 1 (oldest)
        assert!(idx.get(1).is_none());
        assert!(idx.get(2).is_some());
        assert!(idx.get(3).is_some());
    }

    #[test]
    fn lru_tie_break_is_ascending_hash() {
        let mut idx = PrefixCacheIndex::new(2);
        idx.record(5, 0, 10);
        idx.record(3, 0, 10); // same last_used, smaller hash
        idx.record(7, 0, 10); // forces an eviction among last_used==10
        // hash 3 is the smallest key among the tied last_used entries, so it's evicted first
        assert!(idx.get(3).is_none());
    }

    #[test]
    fn matching_blocks_counts_only_named_instance() {
        let mut idx = PrefixCacheIndex::new(10);
        idx.record(1, 0, 0);
        idx.record(2, 1, 0);
        assert_eq!(idx.matching_blocks(&[1, 2], 0), 1);
        assert_eq!(idx.matching_blocks(&[1, 2], 1), 1);
    }

    #[test]
    fn prefix_hashes_only_cover_full_blocks() {
        let tokens: Vec<u32> = (0..10).collect();
        let hashes = compute_prefix_hashes(&tokens, 4);
        assert_eq!(hashes.len(), 2); // 10 tokens / 4 per block = 2 full blocks, 2 leftover dropped
    }

    #[test]
    fn prefix_hashes_are_deterministic() {
        let tokens: Vec<u32> = (0..8).collect();
        assert_eq!(
            compute_prefix_hashes(&tokens, 4),
            compute_prefix_hashes(&tokens, 4)
        );
    }

    #[test]
    fn shared_prefix_group_yields_shared_leading_block_hashes() {
        let a = request_block_hashes(1, Some("group-a"), Some(8), 20, 4);
        let b = request_block_hashes(2, Some("group-a"), Some(8), 20, 4);
        assert_eq!(a[0], b[0]);
        assert_eq!(a[1], b[1]);
        // beyond the shared prefix, hashes diverge (request-unique content)
        assert_ne!(a[2], b[2]);
    }

    #[test]
    fn distinct_prefix_groups_do_not_collide() {
        let a = request_block_hashes(1, Some("group-a"), Some(8), 20, 4);
        let b = request_block_hashes(2, Some("group-b"), Some(8), 20, 4);
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn no_prefix_group_is_entirely_request_unique() {
        let a = request_block_hashes(1, None, None, 16, 4);
        let b = request_block_hashes(2, None, None, 16, 4);
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x != y));
    }
}
