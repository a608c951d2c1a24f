//! Block construction and nonce scanning for test-difficulty networks
//!
//! These helpers drive the chain in tests and local networks. The nonce scan
//! is a plain linear search, so only use it where the target is easy (the
//! regtest parameters); against real difficulty it would spin for ages.

use crate::constants::COINBASE_OUTPUT_INDEX;
use crate::economic;
use crate::merkle;
use crate::params::ChainParameters;
use crate::pow;
use crate::script;
use crate::types::{
    Block, BlockHeader, ChainedBlock, OutPoint, Transaction, TxInput, TxOutput, ZERO_HASH,
};

/// A coinbase claiming the height's subsidy. The height is pushed into the
/// unlocking script so every block's coinbase hash is distinct.
pub fn create_coinbase(height: u64, extra: u32) -> Transaction {
    let mut script_signature = Vec::new();
    script::push_data(&mut script_signature, &height.to_le_bytes());
    script::push_data(&mut script_signature, &extra.to_le_bytes());
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_output: OutPoint {
                tx_hash: ZERO_HASH,
                output_index: COINBASE_OUTPUT_INDEX,
            },
            script_signature,
            sequence: 0xffffffff,
        }],
        outputs: vec![TxOutput {
            value: economic::get_block_subsidy(height),
            // anyone-can-spend, so follow-up test transactions need no keys
            script_public_key: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Scan the nonce space once for a proof-of-work solution. Returns false if
/// the whole space is exhausted at this timestamp.
pub fn mine_header(header: &mut BlockHeader, params: &ChainParameters) -> bool {
    let mut nonce = 0u32;
    loop {
        header.nonce = nonce;
        if pow::check_proof_of_work(header, params.highest_target_bits).is_ok() {
            return true;
        }
        nonce = match nonce.checked_add(1) {
            Some(next) => next,
            None => return false,
        };
    }
}

/// Assemble a block of `transactions` on top of `tip` and mine it. The
/// timestamp bumps until a nonce is found, so this always terminates on
/// easy-target networks.
pub fn mine_block(
    tip: &ChainedBlock,
    params: &ChainParameters,
    mut transactions: Vec<Transaction>,
    time: u32,
) -> Block {
    let height = tip.height + 1;
    let mut block_txs = vec![create_coinbase(height, time)];
    block_txs.append(&mut transactions);
    let tx_hashes: Vec<_> = block_txs.iter().map(Transaction::hash).collect();

    let mut header = BlockHeader {
        version: 1,
        previous_block_hash: tip.block_hash,
        merkle_root: merkle::merkle_root(&tx_hashes),
        time,
        bits: params.highest_target_bits,
        nonce: 0,
    };
    while !mine_header(&mut header, params) {
        header.time += 1;
    }
    Block {
        header,
        transactions: block_txs,
    }
}

/// An empty (coinbase-only) block on top of `tip`, timestamped one target
/// spacing after the tip position.
pub fn mine_empty_block(tip: &ChainedBlock, params: &ChainParameters) -> Block {
    let time = params.genesis_header().time + (tip.height as u32 + 1) * 600;
    mine_block(tip, params, Vec::new(), time)
}

/// As [`mine_empty_block`] with an explicit timestamp, for building distinct
/// siblings at the same height.
pub fn mine_empty_block_with_time(
    tip: &ChainedBlock,
    params: &ChainParameters,
    time: u32,
) -> Block {
    mine_block(tip, params, Vec::new(), time)
}

/// A transaction spending `outpoint` (an anyone-can-spend output) into a
/// single anyone-can-spend output of `value`.
pub fn spend_output(outpoint: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prev_output: outpoint,
            script_signature: Vec::new(),
            sequence: 0xffffffff,
        }],
        outputs: vec![TxOutput {
            value,
            script_public_key: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Blockchain;

    #[test]
    fn test_mined_block_satisfies_pow() {
        let params = ChainParameters::regtest();
        let tip = Blockchain::for_genesis(&params).root().clone();
        let block = mine_empty_block(&tip, &params);

        assert_eq!(block.header.previous_block_hash, params.genesis_hash());
        assert!(
            pow::check_proof_of_work(&block.header, params.highest_target_bits).is_ok()
        );
        assert_eq!(
            block.header.merkle_root,
            merkle::merkle_root(&[block.transactions[0].hash()])
        );
    }

    #[test]
    fn test_coinbase_hashes_are_distinct_per_height() {
        assert_ne!(create_coinbase(1, 0).hash(), create_coinbase(2, 0).hash());
        assert_ne!(create_coinbase(1, 0).hash(), create_coinbase(1, 1).hash());
    }

    #[test]
    fn test_siblings_with_different_times_are_distinct() {
        let params = ChainParameters::regtest();
        let tip = Blockchain::for_genesis(&params).root().clone();
        let a = mine_empty_block_with_time(&tip, &params, 1_000_000);
        let b = mine_empty_block_with_time(&tip, &params, 2_000_000);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.header.previous_block_hash, b.header.previous_block_hash);
    }

    #[test]
    fn test_block_carries_extra_transactions() {
        let params = ChainParameters::regtest();
        let tip = Blockchain::for_genesis(&params).root().clone();
        let base = mine_empty_block(&tip, &params);
        let chained = ChainedBlock::from_parent(&tip, &base.header);

        let spend = spend_output(
            OutPoint {
                tx_hash: base.transactions[0].hash(),
                output_index: 0,
            },
            1_000,
        );
        let block = mine_block(&chained, &params, vec![spend.clone()], 3_000_000);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1], spend);
    }
}
