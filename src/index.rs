//! Chain index: linking an unordered arrival of block headers into a forest
//!
//! Headers arrive in any order. A header whose parent is already chained is
//! promoted to a [`ChainedBlock`] with a definite height and cumulative work;
//! the rest wait as orphans. One chaining pass drains transitively: promoting
//! a parent immediately promotes any orphans waiting on it, iteratively via a
//! worklist rather than by recursion.

use std::collections::HashMap;

use tracing::debug;

use crate::params::ChainParameters;
use crate::types::{BlockHeader, ChainedBlock, Hash};
use crate::wire;

pub struct ChainIndex {
    /// Every header ever seen, chained or not.
    headers: HashMap<Hash, BlockHeader>,
    /// Headers with a complete ancestor path. Entries are never re-chained.
    chained: HashMap<Hash, ChainedBlock>,
    /// Chained children by previous-block hash.
    children: HashMap<Hash, Vec<Hash>>,
    /// First-seen order, the documented tie-break for equal-work chains.
    arrival: HashMap<Hash, u64>,
    next_arrival: u64,
}

impl ChainIndex {
    /// An index seeded with the chain's genesis header, already chained.
    pub fn new(params: &ChainParameters) -> ChainIndex {
        let genesis_header = params.genesis_header().clone();
        let genesis = ChainedBlock::for_genesis(&genesis_header);
        let mut index = ChainIndex {
            headers: HashMap::new(),
            chained: HashMap::new(),
            children: HashMap::new(),
            arrival: HashMap::new(),
            next_arrival: 0,
        };
        index.headers.insert(genesis.block_hash, genesis_header);
        index.arrival.insert(genesis.block_hash, 0);
        index.next_arrival = 1;
        index.chained.insert(genesis.block_hash, genesis);
        index
    }

    /// Record a header. Returns false and changes nothing when the header is
    /// already known, so re-submission is a no-op.
    pub fn add_header(&mut self, header: BlockHeader) -> bool {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return false;
        }
        self.arrival.insert(hash, self.next_arrival);
        self.next_arrival += 1;
        self.headers.insert(hash, header);
        true
    }

    /// One chaining pass: promote every orphan whose ancestor path became
    /// complete, transitively, until the worklist drains. Returns the number
    /// of promotions; the caller re-invokes while progress is being made.
    pub fn chain_pass(&mut self) -> usize {
        // Group the unchained headers by the parent they wait on.
        let mut waiting: HashMap<Hash, Vec<Hash>> = HashMap::new();
        for (hash, header) in &self.headers {
            if !self.chained.contains_key(hash) {
                waiting
                    .entry(header.previous_block_hash)
                    .or_default()
                    .push(*hash);
            }
        }

        // Seed with chained blocks that have orphans waiting on them.
        let mut worklist: Vec<Hash> = waiting
            .keys()
            .filter(|parent| self.chained.contains_key(*parent))
            .copied()
            .collect();

        let mut promoted = 0usize;
        while let Some(parent_hash) = worklist.pop() {
            let Some(children) = waiting.remove(&parent_hash) else {
                continue;
            };
            let parent = self.chained[&parent_hash].clone();
            for child_hash in children {
                if self.chained.contains_key(&child_hash) {
                    continue;
                }
                let header = &self.headers[&child_hash];
                let child = ChainedBlock::from_parent(&parent, header);
                debug!(
                    hash = %wire::hash_to_hex(&child_hash),
                    height = child.height,
                    "chained block"
                );
                self.chained.insert(child_hash, child);
                self.children
                    .entry(parent_hash)
                    .or_default()
                    .push(child_hash);
                // Newly chained blocks may unblock deeper orphans in the
                // same pass.
                worklist.push(child_hash);
                promoted += 1;
            }
        }
        promoted
    }

    /// Parents referenced by orphans whose header bytes have not arrived;
    /// the fetch layer's shopping list.
    pub fn missing_headers(&self) -> Vec<Hash> {
        let mut missing: Vec<Hash> = self
            .headers
            .iter()
            .filter(|(hash, _)| !self.chained.contains_key(*hash))
            .map(|(_, header)| header.previous_block_hash)
            .filter(|parent| !self.headers.contains_key(parent))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Chained blocks with no chained child.
    pub fn find_leaf_chained_blocks(&self) -> Vec<ChainedBlock> {
        self.chained
            .values()
            .filter(|block| {
                self.children
                    .get(&block.block_hash)
                    .map_or(true, |kids| kids.is_empty())
            })
            .cloned()
            .collect()
    }

    pub fn find_by_previous_block_hash(&self, parent: &Hash) -> Vec<ChainedBlock> {
        self.children
            .get(parent)
            .map(|kids| kids.iter().map(|hash| self.chained[hash].clone()).collect())
            .unwrap_or_default()
    }

    /// The ordered genesis-to-leaf ancestor path, if the leaf is chained.
    pub fn try_get_chain_path(&self, leaf: &Hash) -> Option<Vec<ChainedBlock>> {
        let mut path = Vec::new();
        let mut cursor = self.chained.get(leaf)?;
        loop {
            path.push(cursor.clone());
            if cursor.height == 0 {
                break;
            }
            cursor = self.chained.get(&cursor.previous_block_hash)?;
        }
        path.reverse();
        Some(path)
    }

    pub fn is_chained(&self, hash: &Hash) -> bool {
        self.chained.contains_key(hash)
    }

    pub fn contains_header(&self, hash: &Hash) -> bool {
        self.headers.contains_key(hash)
    }

    pub fn chained_block(&self, hash: &Hash) -> Option<&ChainedBlock> {
        self.chained.get(hash)
    }

    pub fn header(&self, hash: &Hash) -> Option<&BlockHeader> {
        self.headers.get(hash)
    }

    pub fn arrival_order(&self, hash: &Hash) -> Option<u64> {
        self.arrival.get(hash).copied()
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn chained_count(&self) -> usize {
        self.chained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining;
    use crate::snapshot::Blockchain;

    fn setup() -> (ChainParameters, ChainIndex) {
        let params = ChainParameters::regtest();
        let index = ChainIndex::new(&params);
        (params, index)
    }

    /// Mine a linear run of empty headers on top of the genesis.
    fn mine_run(params: &ChainParameters, count: usize) -> Vec<BlockHeader> {
        let mut tip = Blockchain::for_genesis(params).root().clone();
        let mut headers = Vec::new();
        for _ in 0..count {
            let block = mining::mine_empty_block(&tip, params);
            tip = ChainedBlock::from_parent(&tip, &block.header);
            headers.push(block.header);
        }
        headers
    }

    #[test]
    fn test_new_index_has_chained_genesis() {
        let (params, index) = setup();
        assert!(index.is_chained(&params.genesis_hash()));
        assert_eq!(index.chained_count(), 1);
        assert_eq!(index.find_leaf_chained_blocks().len(), 1);
    }

    #[test]
    fn test_in_order_chaining() {
        let (params, mut index) = setup();
        for header in mine_run(&params, 3) {
            assert!(index.add_header(header));
        }
        assert_eq!(index.chain_pass(), 3);
        assert_eq!(index.chained_count(), 4);

        let leaves = index.find_leaf_chained_blocks();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].height, 3);
    }

    #[test]
    fn test_orphans_chain_when_parent_arrives() {
        let (params, mut index) = setup();
        let headers = mine_run(&params, 3);

        // Children first: nothing can chain.
        index.add_header(headers[1].clone());
        index.add_header(headers[2].clone());
        assert_eq!(index.chain_pass(), 0);
        assert_eq!(index.chained_count(), 1);
        assert_eq!(index.missing_headers(), vec![headers[1].previous_block_hash]);

        // The missing parent unblocks the whole run transitively in one pass.
        index.add_header(headers[0].clone());
        assert_eq!(index.chain_pass(), 3);
        assert!(index.missing_headers().is_empty());
        assert_eq!(
            index.find_leaf_chained_blocks()[0].block_hash,
            headers[2].hash()
        );
    }

    #[test]
    fn test_cumulative_work_accumulates() {
        let (params, mut index) = setup();
        for header in mine_run(&params, 2) {
            index.add_header(header);
        }
        index.chain_pass();

        let path = index
            .try_get_chain_path(&index.find_leaf_chained_blocks()[0].block_hash)
            .unwrap();
        assert_eq!(path.len(), 3);
        for window in path.windows(2) {
            assert!(window[1].total_work > window[0].total_work);
            assert_eq!(window[1].height, window[0].height + 1);
        }
    }

    #[test]
    fn test_re_adding_header_is_noop() {
        let (params, mut index) = setup();
        let headers = mine_run(&params, 1);
        assert!(index.add_header(headers[0].clone()));
        index.chain_pass();

        let chained_before = index.chained_block(&headers[0].hash()).cloned();
        assert!(!index.add_header(headers[0].clone()));
        assert_eq!(index.chain_pass(), 0);
        assert_eq!(index.chained_block(&headers[0].hash()).cloned(), chained_before);
        assert_eq!(index.chained_count(), 2);
    }

    #[test]
    fn test_fork_produces_two_leaves() {
        let (params, mut index) = setup();
        let genesis = Blockchain::for_genesis(&params).root().clone();
        let a = mining::mine_empty_block_with_time(&genesis, &params, 1_000_000);
        let b = mining::mine_empty_block_with_time(&genesis, &params, 2_000_000);
        index.add_header(a.header.clone());
        index.add_header(b.header.clone());
        assert_eq!(index.chain_pass(), 2);

        let leaves = index.find_leaf_chained_blocks();
        assert_eq!(leaves.len(), 2);
        assert_eq!(
            index
                .find_by_previous_block_hash(&params.genesis_hash())
                .len(),
            2
        );
    }

    #[test]
    fn test_chain_path_unknown_leaf() {
        let (_, index) = setup();
        assert!(index.try_get_chain_path(&[7; 32]).is_none());
    }
}
