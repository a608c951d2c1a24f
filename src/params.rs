//! Chain parameters and validation policy
//!
//! All rule inputs are plain data injected at construction: the genesis
//! block, the maximum target and the network magic. There is no global rule
//! registry and no overridable rule hierarchy.

use crate::constants::{
    COINBASE_OUTPUT_INDEX, INITIAL_SUBSIDY, MAINNET_HIGHEST_TARGET_BITS,
    REGTEST_HIGHEST_TARGET_BITS,
};
use crate::pow;
use crate::types::{Block, BlockHeader, Hash, OutPoint, Transaction, TxInput, TxOutput, ZERO_HASH};
use crate::{merkle, script};

/// Switches that relax validation, for test rigs and trusted replay.
#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    pub bypass_signature_verification: bool,
}

#[derive(Debug, Clone)]
pub struct ChainParameters {
    pub name: &'static str,
    pub network_magic: u32,
    /// Maximum target (minimum difficulty) in compact form.
    pub highest_target_bits: u32,
    pub genesis_block: Block,
}

impl ChainParameters {
    pub fn genesis_header(&self) -> &BlockHeader {
        &self.genesis_block.header
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_block.header.hash()
    }

    /// The real Bitcoin main network.
    pub fn mainnet() -> ChainParameters {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: OutPoint {
                    tx_hash: ZERO_HASH,
                    output_index: COINBASE_OUTPUT_INDEX,
                },
                script_signature: genesis_bytes(
                    "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73",
                ),
                sequence: 0xffffffff,
            }],
            outputs: vec![TxOutput {
                value: INITIAL_SUBSIDY,
                script_public_key: genesis_bytes(
                    "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
                ),
            }],
            lock_time: 0,
        };
        let header = BlockHeader {
            version: 1,
            previous_block_hash: ZERO_HASH,
            merkle_root: merkle::merkle_root(&[coinbase.hash()]),
            time: 1231006505,
            bits: MAINNET_HIGHEST_TARGET_BITS,
            nonce: 2083236893,
        };
        ChainParameters {
            name: "mainnet",
            network_magic: 0xd9b4_bef9,
            highest_target_bits: MAINNET_HIGHEST_TARGET_BITS,
            genesis_block: Block {
                header,
                transactions: vec![coinbase],
            },
        }
    }

    /// A local test network with a target easy enough to mine in-process.
    /// The genesis nonce is found by scanning at construction; at this
    /// target that takes a couple of attempts.
    pub fn regtest() -> ChainParameters {
        let mut coinbase_script = Vec::new();
        script::push_data(&mut coinbase_script, b"regtest genesis");
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: OutPoint {
                    tx_hash: ZERO_HASH,
                    output_index: COINBASE_OUTPUT_INDEX,
                },
                script_signature: coinbase_script,
                sequence: 0xffffffff,
            }],
            outputs: vec![TxOutput {
                value: INITIAL_SUBSIDY,
                // anyone-can-spend; the genesis coinbase is unspendable anyway
                script_public_key: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut header = BlockHeader {
            version: 1,
            previous_block_hash: ZERO_HASH,
            merkle_root: merkle::merkle_root(&[coinbase.hash()]),
            time: 1296688602,
            bits: REGTEST_HIGHEST_TARGET_BITS,
            nonce: 0,
        };
        while pow::check_proof_of_work(&header, REGTEST_HIGHEST_TARGET_BITS).is_err() {
            header.nonce += 1;
        }
        ChainParameters {
            name: "regtest",
            network_magic: 0xdab5_bffa,
            highest_target_bits: REGTEST_HIGHEST_TARGET_BITS,
            genesis_block: Block {
                header,
                transactions: vec![coinbase],
            },
        }
    }
}

fn genesis_bytes(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).expect("genesis constant is valid hex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    #[test]
    fn test_mainnet_genesis_hash() {
        let params = ChainParameters::mainnet();
        assert_eq!(
            wire::hash_to_hex(&params.genesis_hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_mainnet_genesis_merkle_root() {
        let params = ChainParameters::mainnet();
        assert_eq!(
            wire::hash_to_hex(&params.genesis_header().merkle_root),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        // Single transaction: the root is the coinbase hash itself.
        assert_eq!(
            params.genesis_header().merkle_root,
            params.genesis_block.transactions[0].hash()
        );
    }

    #[test]
    fn test_mainnet_genesis_satisfies_its_own_pow() {
        let params = ChainParameters::mainnet();
        assert!(
            pow::check_proof_of_work(params.genesis_header(), params.highest_target_bits).is_ok()
        );
    }

    #[test]
    fn test_regtest_genesis_is_mined() {
        let params = ChainParameters::regtest();
        assert!(
            pow::check_proof_of_work(params.genesis_header(), params.highest_target_bits).is_ok()
        );
        assert_eq!(params.genesis_header().previous_block_hash, ZERO_HASH);
    }

    #[test]
    fn test_networks_have_distinct_genesis() {
        assert_ne!(
            ChainParameters::mainnet().genesis_hash(),
            ChainParameters::regtest().genesis_hash()
        );
    }
}
