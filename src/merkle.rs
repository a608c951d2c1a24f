//! Merkle-root computation over transaction hashes
//!
//! The tree is built bottom-up; a level with an odd node count duplicates its
//! last node. That duplication is Bitcoin's well-known historical quirk and
//! is preserved exactly for hash compatibility.

use crate::types::{Hash, ZERO_HASH};
use crate::wire::double_sha256;

/// Build every level of the merkle tree, leaves first. Level 0 is the input
/// hashes; the last level holds the single root. Exposed in full so that
/// inclusion proofs can be constructed from the intermediate nodes.
pub fn merkle_tree(tx_hashes: &[Hash]) -> Vec<Vec<Hash>> {
    if tx_hashes.is_empty() {
        return Vec::new();
    }
    let mut levels = vec![tx_hashes.to_vec()];
    while levels.last().map(|level| level.len() > 1) == Some(true) {
        let current = levels.last().cloned().unwrap_or_default();
        let mut parents = Vec::with_capacity((current.len() + 1) / 2);
        for pair in current.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&left);
            concat[32..].copy_from_slice(&right);
            parents.push(double_sha256(&concat));
        }
        levels.push(parents);
    }
    levels
}

/// The merkle root of an ordered list of transaction hashes. An empty list
/// yields the zero hash; a single hash is its own root.
pub fn merkle_root(tx_hashes: &[Hash]) -> Hash {
    merkle_tree(tx_hashes)
        .last()
        .and_then(|level| level.first())
        .copied()
        .unwrap_or(ZERO_HASH)
}

/// Sibling path from leaf `index` up to the root, for inclusion proofs.
pub fn merkle_branch(tx_hashes: &[Hash], index: usize) -> Vec<Hash> {
    let levels = merkle_tree(tx_hashes);
    let mut branch = Vec::new();
    let mut position = index;
    for level in &levels {
        if level.len() == 1 {
            break;
        }
        let sibling = if position % 2 == 0 {
            // Odd-count levels pair the last node with itself.
            *level.get(position + 1).unwrap_or(&level[position])
        } else {
            level[position - 1]
        };
        branch.push(sibling);
        position /= 2;
    }
    branch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Hash {
        [byte; 32]
    }

    fn parent(left: &Hash, right: &Hash) -> Hash {
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(left);
        concat[32..].copy_from_slice(right);
        double_sha256(&concat)
    }

    #[test]
    fn test_single_hash_is_its_own_root() {
        let hash = leaf(7);
        assert_eq!(merkle_root(&[hash]), hash);
    }

    #[test]
    fn test_empty_list_yields_zero_hash() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
        assert!(merkle_tree(&[]).is_empty());
    }

    #[test]
    fn test_two_leaves() {
        let (a, b) = (leaf(1), leaf(2));
        assert_eq!(merkle_root(&[a, b]), parent(&a, &b));
    }

    #[test]
    fn test_three_leaves_duplicate_last() {
        // Odd count: the third leaf pairs with itself, and again at the next
        // level if needed.
        let (a, b, c) = (leaf(1), leaf(2), leaf(3));
        let ab = parent(&a, &b);
        let cc = parent(&c, &c);
        let expected = parent(&ab, &cc);
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_tree_exposes_all_levels() {
        let leaves = [leaf(1), leaf(2), leaf(3), leaf(4), leaf(5)];
        let levels = merkle_tree(&leaves);
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[0].len(), 5);
        assert_eq!(levels[1].len(), 3);
        assert_eq!(levels[2].len(), 2);
        assert_eq!(levels[3].len(), 1);
        assert_eq!(levels[3][0], merkle_root(&leaves));
    }

    #[test]
    fn test_branch_recomputes_root() {
        let leaves = [leaf(1), leaf(2), leaf(3)];
        for index in 0..leaves.len() {
            let branch = merkle_branch(&leaves, index);
            let mut node = leaves[index];
            let mut position = index;
            for sibling in branch {
                node = if position % 2 == 0 {
                    parent(&node, &sibling)
                } else {
                    parent(&sibling, &node)
                };
                position /= 2;
            }
            assert_eq!(node, merkle_root(&leaves), "leaf {index}");
        }
    }

    #[test]
    fn test_order_matters() {
        let (a, b) = (leaf(1), leaf(2));
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
