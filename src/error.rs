//! Error taxonomy for chain-state processing

use crate::types::Hash;
use thiserror::Error;

/// Data referenced during processing that is not locally available.
///
/// Not a failure of the chain candidate: the missing hashes are surfaced to
/// the fetch layer and the operation is re-driven once they arrive. Multiple
/// misses are batched into one value rather than reported one at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingData {
    pub block_hashes: Vec<Hash>,
    pub tx_hashes: Vec<Hash>,
    /// Height the operation reached before stalling, if it made any progress.
    pub stalled_at_height: Option<u64>,
}

impl MissingData {
    pub fn block(hash: Hash) -> Self {
        MissingData {
            block_hashes: vec![hash],
            ..Default::default()
        }
    }

    pub fn transaction(hash: Hash) -> Self {
        MissingData {
            tx_hashes: vec![hash],
            ..Default::default()
        }
    }

    pub fn at_height(mut self, height: u64) -> Self {
        self.stalled_at_height = Some(height);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.block_hashes.is_empty() && self.tx_hashes.is_empty()
    }

    /// Fold another batch of misses into this one.
    pub fn merge(&mut self, other: MissingData) {
        for hash in other.block_hashes {
            if !self.block_hashes.contains(&hash) {
                self.block_hashes.push(hash);
            }
        }
        for hash in other.tx_hashes {
            if !self.tx_hashes.contains(&hash) {
                self.tx_hashes.push(hash);
            }
        }
        if self.stalled_at_height.is_none() {
            self.stalled_at_height = other.stalled_at_height;
        }
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    /// Malformed bytes or out-of-range arithmetic, caught at decode time.
    #[error("structural error: {0}")]
    Structural(String),

    /// The block or chain candidate under validation is invalid. Fatal to the
    /// candidate, never to the process.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced block/transaction data is not locally available. Retriable.
    #[error("missing data: {} block(s), {} transaction(s)", .0.block_hashes.len(), .0.tx_hashes.len())]
    MissingData(MissingData),

    /// Cooperative cancellation; no state was mutated.
    #[error("operation cancelled")]
    Cancelled,

    /// The snapshot this operation started from was replaced mid-flight.
    #[error("superseded by a newer chain snapshot")]
    Superseded,
}

impl ChainError {
    pub fn structural(msg: impl Into<String>) -> Self {
        ChainError::Structural(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ChainError::Validation(msg.into())
    }

    pub fn missing_block(hash: Hash) -> Self {
        ChainError::MissingData(MissingData::block(hash))
    }

    pub fn missing_transaction(hash: Hash) -> Self {
        ChainError::MissingData(MissingData::transaction(hash))
    }

    /// True for conditions that may succeed on retry once more data arrives.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ChainError::MissingData(_))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_data_merge_dedupes() {
        let mut a = MissingData::block([1; 32]);
        a.merge(MissingData::block([1; 32]));
        a.merge(MissingData::block([2; 32]));
        a.merge(MissingData::transaction([3; 32]));

        assert_eq!(a.block_hashes.len(), 2);
        assert_eq!(a.tx_hashes.len(), 1);
    }

    #[test]
    fn test_missing_data_keeps_first_stall_height() {
        let mut a = MissingData::block([1; 32]).at_height(5);
        a.merge(MissingData::block([2; 32]).at_height(9));
        assert_eq!(a.stalled_at_height, Some(5));
    }

    #[test]
    fn test_retriable_classification() {
        assert!(ChainError::missing_block([0; 32]).is_retriable());
        assert!(!ChainError::validation("bad merkle root").is_retriable());
        assert!(!ChainError::Cancelled.is_retriable());
        assert!(!ChainError::Superseded.is_retriable());
    }
}
