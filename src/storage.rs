//! Storage interfaces consumed by the core, with in-memory implementations
//!
//! Read misses are not errors anywhere in this module: a `None` from
//! `try_get` feeds the missing-data tracking and the fetch layer. Durable
//! engines plug in behind the same traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use num_bigint::BigInt;
use parking_lot::RwLock;

use crate::error::{ChainError, MissingData, Result};
use crate::snapshot::{Blockchain, UtxoSet};
use crate::types::{Block, ChainedBlock, Hash, OutPoint, OutputStates, Transaction, UnspentTx};
use crate::wire::{self, Reader};

/// Keyed value storage shared by the block, header and transaction stores.
pub trait Store<V: Clone>: Send + Sync {
    fn try_get(&self, key: &Hash) -> Option<V>;
    /// Returns true when the key was newly created.
    fn put(&self, key: Hash, value: V) -> bool;
    fn contains_key(&self, key: &Hash) -> bool;
    fn keys(&self) -> Vec<Hash>;
    fn values(&self) -> Vec<V>;
    /// Batched write. An entry flagged `is_create` fails the whole batch if
    /// the key already exists; nothing is applied on failure.
    fn try_write_values(&self, batch: Vec<(Hash, V, bool)>) -> bool;
}

/// A transaction plus where it was mined, for previous-output lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub block_hash: Hash,
    pub tx_index: u32,
    pub transaction: Transaction,
}

#[derive(Default)]
pub struct MemoryStore<V> {
    map: RwLock<HashMap<Hash, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> MemoryStore<V> {
        MemoryStore {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl<V: Clone + Send + Sync> Store<V> for MemoryStore<V> {
    fn try_get(&self, key: &Hash) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: Hash, value: V) -> bool {
        self.map.write().insert(key, value).is_none()
    }

    fn contains_key(&self, key: &Hash) -> bool {
        self.map.read().contains_key(key)
    }

    fn keys(&self) -> Vec<Hash> {
        self.map.read().keys().copied().collect()
    }

    fn values(&self) -> Vec<V> {
        self.map.read().values().cloned().collect()
    }

    fn try_write_values(&self, batch: Vec<(Hash, V, bool)>) -> bool {
        let mut map = self.map.write();
        if batch
            .iter()
            .any(|(key, _, is_create)| *is_create && map.contains_key(key))
        {
            return false;
        }
        for (key, value, _) in batch {
            map.insert(key, value);
        }
        true
    }
}

/// Persistence for whole blockchain snapshots, keyed by insertion order.
pub trait BlockchainStore: Send + Sync {
    /// Every persisted snapshot with its total work.
    fn list_blockchains(&self) -> Vec<(u64, BigInt)>;
    /// Rebuild a snapshot. The transaction store supplies output counts and
    /// mining locations for the persisted outpoints; anything absent there
    /// surfaces as missing data.
    fn read_blockchain(
        &self,
        key: u64,
        transactions: &dyn Store<TransactionRecord>,
    ) -> Result<Blockchain>;
    fn write_blockchain(&self, chain: &Blockchain) -> Result<u64>;
    /// Garbage-collect snapshots with strictly less total work.
    fn remove_blockchains_below(&self, total_work: &BigInt);
}

#[derive(Default)]
pub struct MemoryBlockchainStore {
    entries: RwLock<BTreeMap<u64, (BigInt, Vec<u8>)>>,
    next_key: AtomicU64,
}

impl MemoryBlockchainStore {
    pub fn new() -> MemoryBlockchainStore {
        MemoryBlockchainStore::default()
    }
}

impl BlockchainStore for MemoryBlockchainStore {
    fn list_blockchains(&self) -> Vec<(u64, BigInt)> {
        self.entries
            .read()
            .iter()
            .map(|(key, (work, _))| (*key, work.clone()))
            .collect()
    }

    fn read_blockchain(
        &self,
        key: u64,
        transactions: &dyn Store<TransactionRecord>,
    ) -> Result<Blockchain> {
        let bytes = self
            .entries
            .read()
            .get(&key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ChainError::structural(format!("no persisted snapshot under key {key}")))?;
        deserialize_blockchain(&bytes, transactions)
    }

    fn write_blockchain(&self, chain: &Blockchain) -> Result<u64> {
        let bytes = serialize_blockchain(chain);
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.entries
            .write()
            .insert(key, (chain.total_work().clone(), bytes));
        Ok(key)
    }

    fn remove_blockchains_below(&self, total_work: &BigInt) {
        self.entries
            .write()
            .retain(|_, (work, _)| &*work >= total_work);
    }
}

/// UTXO entries per chunk in the persisted layout.
const UTXO_CHUNK_SIZE: usize = 1024;

/// Snapshot byte layout: a length-prefixed list of block-metadata rows
/// (hash, previous hash, block work, height, total work, validity flag),
/// then chunked UTXO records, each chunk a length-prefixed run of 36-byte
/// entries (32-byte tx hash + 4-byte output index).
pub fn serialize_blockchain(chain: &Blockchain) -> Vec<u8> {
    let mut buf = Vec::new();

    wire::write_var_int(&mut buf, chain.blocks().len() as u64);
    let mut parent_work = BigInt::from(0);
    for block in chain.blocks() {
        buf.extend_from_slice(&block.block_hash);
        buf.extend_from_slice(&block.previous_block_hash);
        let block_work = &block.total_work - &parent_work;
        wire::write_var_bytes(&mut buf, &block_work.to_signed_bytes_le());
        buf.extend_from_slice(&block.height.to_le_bytes());
        wire::write_var_bytes(&mut buf, &block.total_work.to_signed_bytes_le());
        buf.push(1); // validity flag
        parent_work = block.total_work.clone();
    }

    let outpoints = chain.utxo().unspent_outpoints();
    let chunks: Vec<&[OutPoint]> = outpoints.chunks(UTXO_CHUNK_SIZE).collect();
    wire::write_var_int(&mut buf, chunks.len() as u64);
    for chunk in chunks {
        wire::write_var_int(&mut buf, chunk.len() as u64);
        for outpoint in chunk {
            buf.extend_from_slice(&outpoint.tx_hash);
            buf.extend_from_slice(&outpoint.output_index.to_le_bytes());
        }
    }
    buf
}

pub fn deserialize_blockchain(
    bytes: &[u8],
    transactions: &dyn Store<TransactionRecord>,
) -> Result<Blockchain> {
    let mut reader = Reader::new(bytes);

    let block_count = reader.read_var_int()?;
    let mut blocks = Vec::with_capacity(block_count.min(1 << 20) as usize);
    for _ in 0..block_count {
        let block_hash = reader.read_hash()?;
        let previous_block_hash = reader.read_hash()?;
        let _block_work = BigInt::from_signed_bytes_le(&reader.read_var_bytes()?);
        let height = reader.read_u64()?;
        let total_work = BigInt::from_signed_bytes_le(&reader.read_var_bytes()?);
        let validity = reader.read_u8()?;
        if validity != 1 {
            return Err(ChainError::validation(format!(
                "persisted snapshot marks block {} invalid",
                wire::hash_to_hex(&block_hash)
            )));
        }
        blocks.push(ChainedBlock {
            block_hash,
            previous_block_hash,
            height,
            total_work,
        });
    }

    let chunk_count = reader.read_var_int()?;
    let mut outpoints: Vec<OutPoint> = Vec::new();
    for _ in 0..chunk_count {
        let entry_count = reader.read_var_int()?;
        for _ in 0..entry_count {
            outpoints.push(OutPoint {
                tx_hash: reader.read_hash()?,
                output_index: reader.read_u32()?,
            });
        }
    }
    if reader.remaining() != 0 {
        return Err(ChainError::structural("trailing bytes after snapshot"));
    }

    // Regroup the flat outpoints into per-transaction bitmaps; the
    // transaction store supplies output counts and mining locations.
    let mut by_tx: BTreeMap<Hash, Vec<u32>> = BTreeMap::new();
    for outpoint in outpoints {
        by_tx.entry(outpoint.tx_hash).or_default().push(outpoint.output_index);
    }

    let mut utxo = UtxoSet::new();
    let mut missing = MissingData::default();
    for (tx_hash, unspent_indexes) in by_tx {
        let Some(record) = transactions.try_get(&tx_hash) else {
            missing.merge(MissingData::transaction(tx_hash));
            continue;
        };
        let mut output_states = OutputStates::all_spent(record.transaction.outputs.len());
        for index in unspent_indexes {
            if !output_states.set(index as usize, true) {
                return Err(ChainError::structural(format!(
                    "persisted outpoint {}:{index} out of range",
                    wire::hash_to_hex(&tx_hash)
                )));
            }
        }
        utxo.insert_tx(UnspentTx {
            block_hash: record.block_hash,
            tx_index: record.tx_index,
            tx_hash,
            output_states,
        })?;
    }
    if !missing.is_empty() {
        return Err(ChainError::MissingData(missing));
    }

    Blockchain::new(blocks, utxo)
}

/// Insert a block and each of its transactions into the backing stores.
pub fn store_block(
    blocks: &dyn Store<Block>,
    transactions: &dyn Store<TransactionRecord>,
    block: &Block,
) {
    let block_hash = block.hash();
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        transactions.put(
            tx.hash(),
            TransactionRecord {
                block_hash,
                tx_index: tx_index as u32,
                transaction: tx.clone(),
            },
        );
    }
    blocks.put(block_hash, block.clone());
}
