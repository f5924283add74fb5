//! In-memory view of the block tree and the active chain.

use std::collections::{HashMap, VecDeque};

use ledgerd_consensus::Hash256;
use ledgerd_pow::difficulty::HeaderInfo;
use smallvec::SmallVec;

use crate::blockindex::{BlockIndexEntry, STATUS_VALID};
use crate::indexes::IndexFlags;

#[derive(Default)]
pub struct BlockTree {
    entries: HashMap<Hash256, BlockIndexEntry>,
    children: HashMap<Hash256, SmallVec<[Hash256; 2]>>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (Hash256, BlockIndexEntry)>) -> Self {
        let mut tree = Self::new();
        for (hash, entry) in entries {
            tree.insert(hash, entry);
        }
        tree
    }

    /// Adds or replaces an entry. Genesis has no parent link.
    pub fn insert(&mut self, hash: Hash256, entry: BlockIndexEntry) {
        let parent = entry.header.prev_block;
        let is_root = entry.height == 0;
        if self.entries.insert(hash, entry).is_none() && !is_root {
            self.children.entry(parent).or_default().push(hash);
        }
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut BlockIndexEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash256, &BlockIndexEntry)> {
        self.entries.iter()
    }

    pub fn children(&self, hash: &Hash256) -> &[Hash256] {
        self.children
            .get(hash)
            .map(|children| children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, hash: &Hash256) -> Option<Hash256> {
        let entry = self.entries.get(hash)?;
        if entry.height == 0 {
            return None;
        }
        Some(entry.header.prev_block)
    }

    /// Hash of the ancestor of `hash` at `height`, walking parent links.
    pub fn ancestor_at(&self, hash: &Hash256, height: i32) -> Option<Hash256> {
        let mut cursor = *hash;
        loop {
            let entry = self.entries.get(&cursor)?;
            if entry.height == height {
                return Some(cursor);
            }
            if entry.height < height || entry.height == 0 {
                return None;
            }
            cursor = entry.header.prev_block;
        }
    }

    /// Up to `count` headers ending at `hash`, oldest first.
    pub fn ancestors_info(&self, hash: &Hash256, count: usize) -> Vec<HeaderInfo> {
        let mut out = Vec::with_capacity(count.min(4096));
        let mut cursor = Some(*hash);
        while let Some(current) = cursor {
            if out.len() == count {
                break;
            }
            let Some(entry) = self.entries.get(&current) else {
                break;
            };
            out.push(entry.header_info());
            cursor = self.parent(&current);
        }
        out.reverse();
        out
    }

    /// Last common ancestor of two blocks.
    pub fn find_fork(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let mut left = *a;
        let mut right = *b;
        let mut left_height = self.entries.get(&left)?.height;
        let mut right_height = self.entries.get(&right)?.height;
        while left_height > right_height {
            left = self.parent(&left)?;
            left_height -= 1;
        }
        while right_height > left_height {
            right = self.parent(&right)?;
            right_height -= 1;
        }
        while left != right {
            left = self.parent(&left)?;
            right = self.parent(&right)?;
        }
        Some(left)
    }

    /// Every block built on `hash`, breadth first.
    pub fn descendants(&self, hash: &Hash256) -> Vec<Hash256> {
        let mut out = Vec::new();
        let mut queue: VecDeque<Hash256> = self.children(hash).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            queue.extend(self.children(&next).iter().copied());
            out.push(next);
        }
        out
    }
}

/// Hashes of the canonical chain indexed by height.
#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    hashes: Vec<Hash256>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks parent links from `tip` back to genesis.
    pub fn from_tip(tree: &BlockTree, tip: &Hash256) -> Option<Self> {
        let height = tree.get(tip)?.height;
        let mut hashes = vec![[0u8; 32]; height as usize + 1];
        let mut cursor = *tip;
        for slot in (0..=height as usize).rev() {
            hashes[slot] = cursor;
            if slot > 0 {
                cursor = tree.parent(&cursor)?;
            }
        }
        Some(Self { hashes })
    }

    pub fn tip(&self) -> Option<&Hash256> {
        self.hashes.last()
    }

    /// Height of the tip, or -1 before genesis is connected.
    pub fn height(&self) -> i32 {
        self.hashes.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<&Hash256> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.hashes.get(height))
    }

    pub fn contains(&self, hash: &Hash256, height: i32) -> bool {
        self.at(height) == Some(hash)
    }

    pub fn push(&mut self, hash: Hash256) {
        self.hashes.push(hash);
    }

    pub fn pop(&mut self) -> Option<Hash256> {
        self.hashes.pop()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hash256> {
        self.hashes.iter()
    }
}

/// Everything readers need for a consistent answer, guarded by one lock.
#[derive(Default)]
pub struct ChainView {
    pub tree: BlockTree,
    pub active: ActiveChain,
    pub indexes: IndexFlags,
}

impl ChainView {
    pub fn is_active(&self, hash: &Hash256) -> bool {
        self.tree
            .get(hash)
            .is_some_and(|entry| self.active.contains(hash, entry.height))
    }

    /// Applies a committed connect to the in-memory view.
    pub fn mark_connected(&mut self, hash: Hash256) {
        if let Some(entry) = self.tree.get_mut(&hash) {
            entry.status |= STATUS_VALID;
        }
        self.active.push(hash);
    }

    pub fn mark_disconnected(&mut self) -> Option<Hash256> {
        self.active.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::BlockHeader;

    fn entry(prev: Hash256, height: i32, nonce: u32) -> (Hash256, BlockIndexEntry) {
        let header = BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_000 + height as u32,
            bits: 0x207fffff,
            nonce,
        };
        let hash = header.hash();
        let mut entry = BlockIndexEntry::genesis(header).expect("entry");
        entry.height = height;
        (hash, entry)
    }

    #[test]
    fn fork_and_ancestors() {
        let (g, genesis) = entry([0u8; 32], 0, 0);
        let (a1, e_a1) = entry(g, 1, 1);
        let (a2, e_a2) = entry(a1, 2, 2);
        let (b2, e_b2) = entry(a1, 2, 3);
        let (b3, e_b3) = entry(b2, 3, 4);
        let tree = BlockTree::from_entries(vec![
            (g, genesis),
            (a1, e_a1),
            (a2, e_a2),
            (b2, e_b2),
            (b3, e_b3),
        ]);

        assert_eq!(tree.find_fork(&a2, &b3), Some(a1));
        assert_eq!(tree.ancestor_at(&b3, 1), Some(a1));
        assert_eq!(tree.ancestor_at(&b3, 4), None);
        assert_eq!(tree.children(&a1).len(), 2);
        assert_eq!(tree.descendants(&a1).len(), 3);

        let infos = tree.ancestors_info(&b3, 3);
        let heights: Vec<i64> = infos.iter().map(|info| info.height).collect();
        assert_eq!(heights, vec![1, 2, 3]);
        assert_eq!(tree.ancestors_info(&b3, 10).len(), 4);

        let active = ActiveChain::from_tip(&tree, &b3).expect("chain");
        assert_eq!(active.height(), 3);
        assert!(active.contains(&b2, 2));
        assert!(!active.contains(&a2, 2));
        assert_eq!(active.at(0), Some(&g));
    }
}
