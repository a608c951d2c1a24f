//! Best-chain selection among fully-chained candidates

use std::collections::HashSet;

use crate::index::ChainIndex;
use crate::types::{ChainedBlock, Hash};

/// The selected leaf and its full genesis-to-leaf ancestor path.
#[derive(Debug, Clone, PartialEq)]
pub struct Winner {
    pub leaf: ChainedBlock,
    pub path: Vec<ChainedBlock>,
}

/// Pick the leaf with strictly greatest cumulative work.
///
/// Equal-work candidates fall back to arrival order: the first one seen
/// wins. That tie-break is order-dependent and therefore non-deterministic
/// across nodes; it is the documented historical behavior, kept as-is rather
/// than silently hardened (e.g. to lowest-hash).
pub fn select_winner(index: &ChainIndex) -> Option<Winner> {
    select_winner_excluding(index, &HashSet::new())
}

/// As [`select_winner`], skipping candidates whose path crosses a block that
/// previously failed validation. Returns None when no candidate remains.
pub fn select_winner_excluding(index: &ChainIndex, invalid: &HashSet<Hash>) -> Option<Winner> {
    let mut leaves = index.find_leaf_chained_blocks();
    leaves.sort_by(|a, b| {
        b.total_work.cmp(&a.total_work).then_with(|| {
            let a_seen = index.arrival_order(&a.block_hash).unwrap_or(u64::MAX);
            let b_seen = index.arrival_order(&b.block_hash).unwrap_or(u64::MAX);
            a_seen.cmp(&b_seen)
        })
    });

    for leaf in leaves {
        let Some(path) = index.try_get_chain_path(&leaf.block_hash) else {
            continue;
        };
        if path.iter().any(|block| invalid.contains(&block.block_hash)) {
            continue;
        }
        return Some(Winner { leaf, path });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining;
    use crate::params::ChainParameters;
    use crate::snapshot::Blockchain;
    use crate::types::BlockHeader;

    fn grown_index(params: &ChainParameters, lengths: &[usize]) -> (ChainIndex, Vec<Vec<BlockHeader>>) {
        let mut index = ChainIndex::new(params);
        let genesis = Blockchain::for_genesis(params).root().clone();
        let mut branches = Vec::new();
        for (branch, &length) in lengths.iter().enumerate() {
            let mut tip = genesis.clone();
            let mut headers = Vec::new();
            for height in 0..length {
                let time = 1_000_000 * (branch as u32 + 1) + height as u32;
                let block = mining::mine_empty_block_with_time(&tip, params, time);
                tip = crate::types::ChainedBlock::from_parent(&tip, &block.header);
                index.add_header(block.header.clone());
                headers.push(block.header);
            }
            branches.push(headers);
        }
        while index.chain_pass() > 0 {}
        (index, branches)
    }

    #[test]
    fn test_longest_branch_wins() {
        let params = ChainParameters::regtest();
        let (index, branches) = grown_index(&params, &[2, 5]);
        let winner = select_winner(&index).unwrap();
        assert_eq!(winner.leaf.block_hash, branches[1][4].hash());
        assert_eq!(winner.path.len(), 6);
        assert_eq!(winner.path[0].block_hash, params.genesis_hash());
    }

    #[test]
    fn test_equal_work_tie_goes_to_first_seen() {
        let params = ChainParameters::regtest();
        // Two single-block branches: identical work, branch 0 arrived first.
        let (index, branches) = grown_index(&params, &[1, 1]);
        let winner = select_winner(&index).unwrap();
        assert_eq!(winner.leaf.block_hash, branches[0][0].hash());
    }

    #[test]
    fn test_genesis_only_index_selects_genesis() {
        let params = ChainParameters::regtest();
        let index = ChainIndex::new(&params);
        let winner = select_winner(&index).unwrap();
        assert_eq!(winner.leaf.block_hash, params.genesis_hash());
        assert_eq!(winner.path.len(), 1);
    }

    #[test]
    fn test_invalid_candidate_falls_back_to_next_best() {
        let params = ChainParameters::regtest();
        let (index, branches) = grown_index(&params, &[2, 5]);

        let mut invalid = HashSet::new();
        invalid.insert(branches[1][3].hash());
        let winner = select_winner_excluding(&index, &invalid).unwrap();
        assert_eq!(winner.leaf.block_hash, branches[0][1].hash());
    }

    #[test]
    fn test_all_candidates_invalid_yields_none() {
        let params = ChainParameters::regtest();
        let index = ChainIndex::new(&params);
        let mut invalid = HashSet::new();
        invalid.insert(params.genesis_hash());
        assert!(select_winner_excluding(&index, &invalid).is_none());
    }
}
