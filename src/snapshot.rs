//! The UTXO set and immutable blockchain snapshots

use std::collections::HashMap;

use num_bigint::BigInt;

use crate::error::{ChainError, Result};
use crate::params::ChainParameters;
use crate::types::{ChainedBlock, Hash, OutPoint, UnspentTx, ZERO_HASH};
use crate::wire;

/// All transactions with at least one unspent output, keyed by tx hash.
///
/// An entry whose last output bit is cleared is removed outright, so the map
/// never holds an all-spent record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    map: HashMap<Hash, UnspentTx>,
}

impl UtxoSet {
    pub fn new() -> UtxoSet {
        UtxoSet::default()
    }

    /// Number of transactions with unspent outputs.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of individual unspent outputs.
    pub fn output_count(&self) -> usize {
        self.map
            .values()
            .map(|entry| entry.output_states.unspent_count())
            .sum()
    }

    pub fn get(&self, tx_hash: &Hash) -> Option<&UnspentTx> {
        self.map.get(tx_hash)
    }

    /// Whether the referenced output exists and is still unspent.
    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.map
            .get(&outpoint.tx_hash)
            .and_then(|entry| entry.output_states.get(outpoint.output_index as usize))
            == Some(true)
    }

    /// Register a freshly mined transaction's outputs, all unspent.
    pub fn insert_tx(&mut self, unspent: UnspentTx) -> Result<()> {
        if self.map.contains_key(&unspent.tx_hash) {
            return Err(ChainError::validation(format!(
                "duplicate transaction {} in UTXO set",
                wire::hash_to_hex(&unspent.tx_hash)
            )));
        }
        self.map.insert(unspent.tx_hash, unspent);
        Ok(())
    }

    /// Mark the referenced output spent. Fails if the output does not exist
    /// or was already consumed (a double spend). Returns the entry as it was
    /// before the spend.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<UnspentTx> {
        let entry = self.map.get_mut(&outpoint.tx_hash).ok_or_else(|| {
            ChainError::validation(format!(
                "spend of unknown output {}:{}",
                wire::hash_to_hex(&outpoint.tx_hash),
                outpoint.output_index
            ))
        })?;
        let index = outpoint.output_index as usize;
        match entry.output_states.get(index) {
            Some(true) => {}
            Some(false) => {
                return Err(ChainError::validation(format!(
                    "double spend of output {}:{}",
                    wire::hash_to_hex(&outpoint.tx_hash),
                    outpoint.output_index
                )));
            }
            None => {
                return Err(ChainError::validation(format!(
                    "spend of out-of-range output {}:{}",
                    wire::hash_to_hex(&outpoint.tx_hash),
                    outpoint.output_index
                )));
            }
        }
        let before = entry.clone();
        entry.output_states.set(index, false);
        if !entry.output_states.any_unspent() {
            self.map.remove(&outpoint.tx_hash);
        }
        Ok(before)
    }

    /// Undo a spend. Recreates the entry via `make_entry` when every output
    /// had been consumed and the record was dropped.
    pub fn restore(
        &mut self,
        outpoint: &OutPoint,
        make_entry: impl FnOnce() -> UnspentTx,
    ) -> Result<()> {
        let entry = self
            .map
            .entry(outpoint.tx_hash)
            .or_insert_with(make_entry);
        let index = outpoint.output_index as usize;
        match entry.output_states.get(index) {
            Some(false) => {
                entry.output_states.set(index, true);
                Ok(())
            }
            Some(true) => Err(ChainError::validation(format!(
                "restore of output {}:{} that is already unspent",
                wire::hash_to_hex(&outpoint.tx_hash),
                outpoint.output_index
            ))),
            None => Err(ChainError::validation(format!(
                "restore of out-of-range output {}:{}",
                wire::hash_to_hex(&outpoint.tx_hash),
                outpoint.output_index
            ))),
        }
    }

    /// Drop a transaction's entry entirely (rollback of the block that mined
    /// it). Fails if outputs had already been spent elsewhere; rollback order
    /// guarantees they are all unspent again by the time this runs.
    pub fn remove_tx(&mut self, tx_hash: &Hash) -> Result<UnspentTx> {
        let entry = self.map.remove(tx_hash).ok_or_else(|| {
            ChainError::validation(format!(
                "rollback of transaction {} missing from UTXO set",
                wire::hash_to_hex(tx_hash)
            ))
        })?;
        if entry.output_states.unspent_count() != entry.output_states.len() {
            return Err(ChainError::validation(format!(
                "rollback of transaction {} with outputs still spent",
                wire::hash_to_hex(tx_hash)
            )));
        }
        Ok(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnspentTx> {
        self.map.values()
    }

    /// Every unspent outpoint, sorted for deterministic persistence.
    pub fn unspent_outpoints(&self) -> Vec<OutPoint> {
        let mut outpoints: Vec<OutPoint> = self
            .map
            .values()
            .flat_map(|entry| {
                entry
                    .output_states
                    .unspent_indexes()
                    .into_iter()
                    .map(|index| OutPoint {
                        tx_hash: entry.tx_hash,
                        output_index: index,
                    })
            })
            .collect();
        outpoints.sort_by(|a, b| {
            a.tx_hash
                .cmp(&b.tx_hash)
                .then(a.output_index.cmp(&b.output_index))
        });
        outpoints
    }
}

/// An immutable path through the block forest from genesis to one root, plus
/// the UTXO set produced by every transaction along that path.
///
/// Snapshots are never mutated: the calculator builds a new one and the
/// daemon swaps the shared reference atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct Blockchain {
    blocks: Vec<ChainedBlock>,
    utxo: UtxoSet,
}

impl Blockchain {
    pub fn new(blocks: Vec<ChainedBlock>, utxo: UtxoSet) -> Result<Blockchain> {
        let chain = Blockchain { blocks, utxo };
        chain.check_invariants()?;
        Ok(chain)
    }

    /// The snapshot holding only the genesis block. Its coinbase is
    /// unspendable by design and never enters the UTXO set.
    pub fn for_genesis(params: &ChainParameters) -> Blockchain {
        Blockchain {
            blocks: vec![ChainedBlock::for_genesis(params.genesis_header())],
            utxo: UtxoSet::new(),
        }
    }

    fn check_invariants(&self) -> Result<()> {
        let first = self
            .blocks
            .first()
            .ok_or_else(|| ChainError::structural("snapshot has no blocks"))?;
        if first.height != 0 {
            return Err(ChainError::structural("snapshot does not start at genesis"));
        }
        if first.previous_block_hash != ZERO_HASH {
            return Err(ChainError::structural(
                "genesis previous-block hash is not zero",
            ));
        }
        for (index, window) in self.blocks.windows(2).enumerate() {
            if window[1].height != window[0].height + 1 {
                return Err(ChainError::structural(format!(
                    "non-consecutive heights at index {index}"
                )));
            }
            if window[1].previous_block_hash != window[0].block_hash {
                return Err(ChainError::structural(format!(
                    "broken previous-hash linkage at height {}",
                    window[1].height
                )));
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &ChainedBlock {
        // non-empty by construction
        self.blocks.last().expect("snapshot has a genesis block")
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn total_work(&self) -> &BigInt {
        &self.root().total_work
    }

    pub fn blocks(&self) -> &[ChainedBlock] {
        &self.blocks
    }

    pub fn block_at(&self, height: u64) -> Option<&ChainedBlock> {
        self.blocks.get(height as usize)
    }

    pub fn utxo(&self) -> &UtxoSet {
        &self.utxo
    }

    /// Decompose into a working copy for the calculator.
    pub fn into_parts(self) -> (Vec<ChainedBlock>, UtxoSet) {
        (self.blocks, self.utxo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputStates;

    fn unspent(tx_hash: Hash, outputs: usize) -> UnspentTx {
        UnspentTx {
            block_hash: [9; 32],
            tx_index: 1,
            tx_hash,
            output_states: OutputStates::all_unspent(outputs),
        }
    }

    #[test]
    fn test_spend_and_entry_removal() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 2)).unwrap();
        assert_eq!(utxo.output_count(), 2);

        utxo.spend(&OutPoint {
            tx_hash: [1; 32],
            output_index: 0,
        })
        .unwrap();
        assert_eq!(utxo.len(), 1);
        assert_eq!(utxo.output_count(), 1);

        // Spending the last output removes the entry entirely.
        utxo.spend(&OutPoint {
            tx_hash: [1; 32],
            output_index: 1,
        })
        .unwrap();
        assert!(utxo.is_empty());
    }

    #[test]
    fn test_double_spend_rejected() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 2)).unwrap();
        let outpoint = OutPoint {
            tx_hash: [1; 32],
            output_index: 0,
        };
        utxo.spend(&outpoint).unwrap();
        assert!(matches!(
            utxo.spend(&outpoint),
            Err(ChainError::Validation(_))
        ));
    }

    #[test]
    fn test_spend_unknown_or_out_of_range() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 1)).unwrap();
        assert!(utxo
            .spend(&OutPoint {
                tx_hash: [2; 32],
                output_index: 0,
            })
            .is_err());
        assert!(utxo
            .spend(&OutPoint {
                tx_hash: [1; 32],
                output_index: 5,
            })
            .is_err());
    }

    #[test]
    fn test_restore_recreates_dropped_entry() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 1)).unwrap();
        let outpoint = OutPoint {
            tx_hash: [1; 32],
            output_index: 0,
        };
        utxo.spend(&outpoint).unwrap();
        assert!(utxo.is_empty());

        utxo.restore(&outpoint, || UnspentTx {
            block_hash: [9; 32],
            tx_index: 1,
            tx_hash: [1; 32],
            output_states: OutputStates::all_spent(1),
        })
        .unwrap();
        assert!(utxo.is_unspent(&outpoint));
    }

    #[test]
    fn test_restore_of_unspent_output_is_error() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 1)).unwrap();
        let outpoint = OutPoint {
            tx_hash: [1; 32],
            output_index: 0,
        };
        let result = utxo.restore(&outpoint, || unspent([1; 32], 1));
        assert!(result.is_err());
    }

    #[test]
    fn test_remove_tx_requires_fully_unspent() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 2)).unwrap();
        utxo.spend(&OutPoint {
            tx_hash: [1; 32],
            output_index: 0,
        })
        .unwrap();
        assert!(utxo.remove_tx(&[1; 32]).is_err());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([1; 32], 1)).unwrap();
        assert!(utxo.insert_tx(unspent([1; 32], 1)).is_err());
    }

    #[test]
    fn test_unspent_outpoints_sorted() {
        let mut utxo = UtxoSet::new();
        utxo.insert_tx(unspent([2; 32], 2)).unwrap();
        utxo.insert_tx(unspent([1; 32], 1)).unwrap();
        let outpoints = utxo.unspent_outpoints();
        assert_eq!(outpoints.len(), 3);
        assert_eq!(outpoints[0].tx_hash, [1; 32]);
        assert_eq!(outpoints[1].output_index, 0);
        assert_eq!(outpoints[2].output_index, 1);
    }

    #[test]
    fn test_genesis_snapshot() {
        let params = ChainParameters::regtest();
        let chain = Blockchain::for_genesis(&params);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.root().block_hash, params.genesis_hash());
        // The genesis coinbase never enters the UTXO set.
        assert!(chain.utxo().is_empty());
    }

    #[test]
    fn test_invariant_rejects_broken_linkage() {
        let params = ChainParameters::regtest();
        let genesis = ChainedBlock::for_genesis(params.genesis_header());
        let bad_child = ChainedBlock {
            block_hash: [3; 32],
            previous_block_hash: [4; 32], // does not match genesis hash
            height: 1,
            total_work: genesis.total_work.clone(),
        };
        assert!(Blockchain::new(vec![genesis, bad_child], UtxoSet::new()).is_err());
    }

    #[test]
    fn test_invariant_rejects_height_gap() {
        let params = ChainParameters::regtest();
        let genesis = ChainedBlock::for_genesis(params.genesis_header());
        let gapped = ChainedBlock {
            block_hash: [3; 32],
            previous_block_hash: genesis.block_hash,
            height: 2,
            total_work: genesis.total_work.clone(),
        };
        assert!(Blockchain::new(vec![genesis, gapped], UtxoSet::new()).is_err());
    }

    #[test]
    fn test_invariant_rejects_empty() {
        assert!(Blockchain::new(Vec::new(), UtxoSet::new()).is_err());
    }
}
