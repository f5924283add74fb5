//! Blocks waiting for their parent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::Hash256;
use ledgerd_primitives::Block;
use smallvec::SmallVec;

struct OrphanEntry {
    block: Block,
    received: Instant,
}

/// Bounded by count and age; the oldest entry goes first when full.
pub struct OrphanPool {
    by_hash: HashMap<Hash256, OrphanEntry>,
    by_parent: HashMap<Hash256, SmallVec<[Hash256; 2]>>,
    limit: usize,
    ttl: Duration,
}

impl OrphanPool {
    pub fn new(limit: usize, ttl: Duration) -> Self {
        Self {
            by_hash: HashMap::new(),
            by_parent: HashMap::new(),
            limit,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Holds `block`; returns how many entries were evicted to make room.
    pub fn insert(&mut self, hash: Hash256, block: Block, now: Instant) -> usize {
        if self.limit == 0 || self.by_hash.contains_key(&hash) {
            return 0;
        }
        let mut evicted = self.expire(now);
        while self.by_hash.len() >= self.limit {
            let oldest = self
                .by_hash
                .iter()
                .min_by_key(|(_, entry)| entry.received)
                .map(|(hash, _)| *hash);
            match oldest {
                Some(oldest) => {
                    self.remove(&oldest);
                    evicted += 1;
                }
                None => break,
            }
        }
        let parent = block.header.prev_block;
        self.by_parent.entry(parent).or_default().push(hash);
        self.by_hash.insert(
            hash,
            OrphanEntry {
                block,
                received: now,
            },
        );
        evicted
    }

    /// Drops entries older than the retention window.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Hash256> = self
            .by_hash
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.received) > self.ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            ledgerd_log::log_debug!("orphan {} expired", hash256_to_hex(hash));
            self.remove(hash);
        }
        expired.len()
    }

    /// Removes and returns the unexpired orphans whose parent is `parent`.
    pub fn take_children(&mut self, parent: &Hash256, now: Instant) -> Vec<(Hash256, Block)> {
        self.expire(now);
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        children
            .into_iter()
            .filter_map(|hash| {
                self.by_hash
                    .remove(&hash)
                    .map(|entry| (hash, entry.block))
            })
            .collect()
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let entry = self.by_hash.remove(hash)?;
        let parent = entry.block.header.prev_block;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(entry.block)
    }
}
