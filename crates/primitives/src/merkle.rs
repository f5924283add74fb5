use ledgerd_consensus::Hash256;

use crate::hash::hash_pair;

/// Computes the merkle root of `txids`, duplicating the last node of odd
/// layers. The flag reports two identical adjacent siblings, which lets a
/// different transaction list produce the same root.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            match pair {
                [left, right] => {
                    if left == right {
                        mutated = true;
                    }
                    next.push(hash_pair(left, right));
                }
                [single] => next.push(hash_pair(single, single)),
                _ => {}
            }
        }
        layer = next;
    }
    (layer[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = [7u8; 32];
        assert_eq!(merkle_root(&[leaf]), (leaf, false));
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let (three, mutated) = merkle_root(&[a, b, c]);
        let (four, four_mutated) = merkle_root(&[a, b, c, c]);
        assert_eq!(three, four);
        assert!(!mutated);
        assert!(four_mutated);
    }
}
