//! Core domain types: blocks, transactions, chained blocks, unspent outputs

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::constants::COINBASE_OUTPUT_INDEX;
use crate::wire;

/// 256-bit hash in internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Raw script / payload bytes
pub type ByteString = Vec<u8>;

/// The all-zero hash; previous-block reference of the genesis header
pub const ZERO_HASH: Hash = [0u8; 32];

/// Reference to a transaction output: (creating tx hash, output index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash,
    pub output_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_output: OutPoint,
    pub script_signature: ByteString,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis
    pub value: i64,
    pub script_public_key: ByteString,
}

/// A transaction. Immutable once constructed; the hash is derived from the
/// wire serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double-SHA-256 of the wire serialization.
    pub fn hash(&self) -> Hash {
        wire::transaction_hash(self)
    }

    /// A coinbase spends the sentinel previous output: zero hash, index
    /// 0xffffffff.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_output.tx_hash == ZERO_HASH
            && self.inputs[0].prev_output.output_index == COINBASE_OUTPUT_INDEX
    }
}

/// An 80-byte block header. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub previous_block_hash: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Double-SHA-256 of the 80-byte wire serialization.
    pub fn hash(&self) -> Hash {
        wire::header_hash(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Serialized size in bytes, derived from the wire encoding.
    pub fn size_estimate(&self) -> usize {
        wire::serialize_block(self).len()
    }
}

/// A block whose full ancestor path to genesis is known.
///
/// Created only once the parent is chained, and never modified afterwards: a
/// block is never re-chained. `total_work` is arbitrary-precision so that
/// cumulative comparisons never saturate; it tolerates the negative sentinel
/// produced by work calculation on corrupt bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedBlock {
    pub block_hash: Hash,
    pub previous_block_hash: Hash,
    pub height: u64,
    pub total_work: BigInt,
}

impl ChainedBlock {
    /// Chain a genesis header: height 0, total work = its own work.
    pub fn for_genesis(header: &BlockHeader) -> ChainedBlock {
        ChainedBlock {
            block_hash: header.hash(),
            previous_block_hash: header.previous_block_hash,
            height: 0,
            total_work: crate::pow::calculate_work(header),
        }
    }

    /// Chain a header onto its already-chained parent.
    pub fn from_parent(parent: &ChainedBlock, header: &BlockHeader) -> ChainedBlock {
        ChainedBlock {
            block_hash: header.hash(),
            previous_block_hash: header.previous_block_hash,
            height: parent.height + 1,
            total_work: &parent.total_work + crate::pow::calculate_work(header),
        }
    }
}

/// Per-output spent bitmap for one transaction. Bit set = still unspent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStates {
    bits: Vec<u8>,
    len: usize,
}

impl OutputStates {
    pub fn all_unspent(len: usize) -> OutputStates {
        let mut bits = vec![0u8; (len + 7) / 8];
        for i in 0..len {
            bits[i / 8] |= 1 << (i % 8);
        }
        OutputStates { bits, len }
    }

    pub fn all_spent(len: usize) -> OutputStates {
        OutputStates {
            bits: vec![0u8; (len + 7) / 8],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether output `index` is unspent; None if out of range.
    pub fn get(&self, index: usize) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        Some(self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Set the unspent flag for output `index`. Returns false if out of range.
    pub fn set(&mut self, index: usize, unspent: bool) -> bool {
        if index >= self.len {
            return false;
        }
        if unspent {
            self.bits[index / 8] |= 1 << (index % 8);
        } else {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
        true
    }

    pub fn any_unspent(&self) -> bool {
        (0..self.len).any(|i| self.get(i) == Some(true))
    }

    pub fn unspent_count(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i) == Some(true)).count()
    }

    pub fn unspent_indexes(&self) -> Vec<u32> {
        (0..self.len)
            .filter(|&i| self.get(i) == Some(true))
            .map(|i| i as u32)
            .collect()
    }
}

/// A transaction with at least one unspent output, plus where it was mined.
///
/// Once every output bit is cleared the entry is removed from the UTXO set
/// entirely; an all-zero bitmap never persists there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTx {
    /// Block that mined the transaction
    pub block_hash: Hash,
    /// Position within that block
    pub tx_index: u32,
    pub tx_hash: Hash,
    pub output_states: OutputStates,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coinbase_detection() {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_output: OutPoint {
                    tx_hash: ZERO_HASH,
                    output_index: COINBASE_OUTPUT_INDEX,
                },
                script_signature: vec![],
                sequence: 0xffffffff,
            }],
            outputs: vec![TxOutput {
                value: 50 * 100_000_000,
                script_public_key: vec![0x51],
            }],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());

        let mut not_coinbase = coinbase.clone();
        not_coinbase.inputs[0].prev_output.tx_hash = [1; 32];
        assert!(!not_coinbase.is_coinbase());

        let mut wrong_index = coinbase.clone();
        wrong_index.inputs[0].prev_output.output_index = 0;
        assert!(!wrong_index.is_coinbase());
    }

    #[test]
    fn test_output_states_all_unspent() {
        let states = OutputStates::all_unspent(10);
        assert_eq!(states.len(), 10);
        assert_eq!(states.unspent_count(), 10);
        assert!(states.any_unspent());
        assert_eq!(states.get(9), Some(true));
        assert_eq!(states.get(10), None);
    }

    #[test]
    fn test_output_states_spend_and_restore() {
        let mut states = OutputStates::all_unspent(3);
        assert!(states.set(1, false));
        assert_eq!(states.get(1), Some(false));
        assert_eq!(states.unspent_count(), 2);
        assert_eq!(states.unspent_indexes(), vec![0, 2]);

        assert!(states.set(1, true));
        assert_eq!(states.unspent_count(), 3);
    }

    #[test]
    fn test_output_states_all_spent_is_empty_of_unspent() {
        let states = OutputStates::all_spent(9);
        assert!(!states.any_unspent());
        assert_eq!(states.unspent_count(), 0);
        assert_eq!(states.len(), 9);
    }

    #[test]
    fn test_output_states_out_of_range_set() {
        let mut states = OutputStates::all_unspent(2);
        assert!(!states.set(2, false));
    }
}
