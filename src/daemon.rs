//! The core daemon: workers driving convergence toward the winning chain
//!
//! Five loops cooperate through explicit notifications rather than event
//! subscriptions: chaining (promote orphans), winner selection, the
//! calculator pass, periodic full revalidation and periodic snapshot
//! persistence. Each worker's body is a single task loop, so a worker never
//! runs concurrently with itself; different workers overlap freely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calculator::{self, CalcContext, CancelToken};
use crate::error::{ChainError, MissingData};
use crate::index::ChainIndex;
use crate::params::{ChainParameters, ValidationPolicy};
use crate::selector;
use crate::snapshot::Blockchain;
use crate::storage::{self, BlockchainStore, Store, TransactionRecord};
use crate::types::{Block, BlockHeader, Hash};
use crate::wire;

/// Worker cadence. The defaults keep revalidation rare; it rebuilds the
/// whole chain from genesis.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub revalidate_interval: Duration,
    pub persist_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            revalidate_interval: Duration::from_secs(600),
            persist_interval: Duration::from_secs(60),
        }
    }
}

/// The shared "current snapshot" handle: an atomically swapped immutable
/// reference plus a generation stamp. Readers clone the Arc; a writer
/// replaces it and bumps the generation, and a stale writer loses.
pub struct ChainState {
    current: RwLock<Arc<Blockchain>>,
    generation: AtomicU64,
}

impl ChainState {
    fn new(initial: Arc<Blockchain>) -> ChainState {
        ChainState {
            current: RwLock::new(initial),
            generation: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Arc<Blockchain> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Install `next` only if the generation still matches the one the
    /// writer sampled before starting; first detector aborts, never
    /// last-writer-wins.
    fn try_replace(&self, next: Arc<Blockchain>, sampled_generation: u64) -> bool {
        let mut guard = self.current.write();
        if self.generation.load(Ordering::SeqCst) != sampled_generation {
            return false;
        }
        *guard = next;
        self.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Unconditional replacement, for the revalidation reset path.
    fn replace(&self, next: Arc<Blockchain>) {
        let mut guard = self.current.write();
        *guard = next;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Data the core is waiting on, surfaced for targeted re-fetch.
#[derive(Debug, Default)]
struct MissingTracker {
    blocks: HashSet<Hash>,
    transactions: HashSet<Hash>,
}

impl MissingTracker {
    fn record(&mut self, missing: &MissingData) {
        self.blocks.extend(missing.block_hashes.iter().copied());
        self.transactions.extend(missing.tx_hashes.iter().copied());
    }
}

/// Introspectable daemon state, serializable for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub network: &'static str,
    pub height: u64,
    pub root_hash: String,
    pub total_work: String,
    pub header_count: usize,
    pub chained_count: usize,
    pub missing_block_count: usize,
    pub missing_transaction_count: usize,
}

struct Core {
    params: Arc<ChainParameters>,
    policy: Arc<ValidationPolicy>,
    index: RwLock<ChainIndex>,
    state: ChainState,
    blocks: Arc<dyn Store<Block>>,
    transactions: Arc<dyn Store<TransactionRecord>>,
    blockchains: Arc<dyn BlockchainStore>,
    missing: Mutex<MissingTracker>,
    invalid: Mutex<HashSet<Hash>>,
    notify_chaining: Notify,
    notify_winner: Notify,
    notify_calc: Notify,
    cancel: CancelToken,
}

pub struct CoreDaemon {
    core: Arc<Core>,
    config: DaemonConfig,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl CoreDaemon {
    /// A daemon over in-memory stores, starting from the genesis snapshot.
    pub fn new(params: ChainParameters, policy: ValidationPolicy, config: DaemonConfig) -> CoreDaemon {
        CoreDaemon::with_stores(
            params,
            policy,
            config,
            Arc::new(storage::MemoryStore::new()),
            Arc::new(storage::MemoryStore::new()),
            Arc::new(storage::MemoryBlockchainStore::new()),
        )
    }

    /// A daemon over caller-supplied stores. The best persisted snapshot is
    /// restored when it can be rebuilt; otherwise the daemon starts from
    /// genesis and re-derives everything.
    pub fn with_stores(
        params: ChainParameters,
        policy: ValidationPolicy,
        config: DaemonConfig,
        blocks: Arc<dyn Store<Block>>,
        transactions: Arc<dyn Store<TransactionRecord>>,
        blockchains: Arc<dyn BlockchainStore>,
    ) -> CoreDaemon {
        storage::store_block(blocks.as_ref(), transactions.as_ref(), &params.genesis_block);

        let initial = restore_best_snapshot(&params, blockchains.as_ref(), transactions.as_ref())
            .unwrap_or_else(|| Blockchain::for_genesis(&params));
        info!(
            network = params.name,
            height = initial.height(),
            root = %wire::hash_to_hex(&initial.root().block_hash),
            "starting chain daemon"
        );

        let mut index = ChainIndex::new(&params);
        // Re-seed the index from previously stored blocks so a restart
        // re-chains everything it already had.
        for block in blocks.values() {
            index.add_header(block.header.clone());
        }
        while index.chain_pass() > 0 {}

        let core = Arc::new(Core {
            params: Arc::new(params),
            policy: Arc::new(policy),
            index: RwLock::new(index),
            state: ChainState::new(Arc::new(initial)),
            blocks,
            transactions,
            blockchains,
            missing: Mutex::new(MissingTracker::default()),
            invalid: Mutex::new(HashSet::new()),
            notify_chaining: Notify::new(),
            notify_winner: Notify::new(),
            notify_calc: Notify::new(),
            cancel: CancelToken::new(),
        });
        let (shutdown, _) = watch::channel(false);
        CoreDaemon {
            core,
            config,
            shutdown,
            workers: Vec::new(),
        }
    }

    /// Spawn the worker loops. Must run inside a tokio runtime.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        self.workers.push(tokio::spawn(chaining_worker(
            self.core.clone(),
            self.shutdown.subscribe(),
        )));
        self.workers.push(tokio::spawn(winner_worker(
            self.core.clone(),
            self.shutdown.subscribe(),
        )));
        self.workers.push(tokio::spawn(calculator_worker(
            self.core.clone(),
            self.shutdown.subscribe(),
        )));
        self.workers.push(tokio::spawn(revalidation_worker(
            self.core.clone(),
            self.shutdown.subscribe(),
            self.config.revalidate_interval,
        )));
        self.workers.push(tokio::spawn(persistence_worker(
            self.core.clone(),
            self.shutdown.subscribe(),
            self.config.persist_interval,
        )));
        // Converge on whatever is already stored.
        self.core.notify_chaining.notify_one();
        self.core.notify_calc.notify_one();
    }

    /// Stop every worker at its next cooperative checkpoint and wait.
    pub async fn shutdown(mut self) {
        self.core.cancel.cancel();
        let _ = self.shutdown.send(true);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }

    /// Ingest a full block: stored, indexed and queued for chaining.
    pub fn submit_block(&self, block: Block) {
        let block_hash = block.hash();
        storage::store_block(self.core.blocks.as_ref(), self.core.transactions.as_ref(), &block);
        {
            let mut missing = self.core.missing.lock();
            missing.blocks.remove(&block_hash);
            for tx in &block.transactions {
                missing.transactions.remove(&tx.hash());
            }
        }
        self.core.index.write().add_header(block.header.clone());
        self.core.notify_chaining.notify_one();
        // Block data may be what a stalled calculator pass was waiting on.
        self.core.notify_calc.notify_one();
    }

    /// Ingest a bare header; the block body stays on the missing list until
    /// it arrives.
    pub fn submit_header(&self, header: BlockHeader) {
        let block_hash = header.hash();
        if !self.core.blocks.contains_key(&block_hash) {
            self.core.missing.lock().blocks.insert(block_hash);
        }
        self.core.index.write().add_header(header);
        self.core.notify_chaining.notify_one();
    }

    pub fn current_snapshot(&self) -> Arc<Blockchain> {
        self.core.state.current()
    }

    pub fn generation(&self) -> u64 {
        self.core.state.generation()
    }

    /// Block data the core still needs; the fetch layer's work queue.
    pub fn missing_blocks(&self) -> Vec<Hash> {
        self.core.missing.lock().blocks.iter().copied().collect()
    }

    pub fn missing_transactions(&self) -> Vec<Hash> {
        self.core.missing.lock().transactions.iter().copied().collect()
    }

    /// Parents of orphan headers whose bytes have not arrived at all.
    pub fn missing_headers(&self) -> Vec<Hash> {
        self.core.index.read().missing_headers()
    }

    pub fn status(&self) -> ChainStatus {
        let current = self.core.state.current();
        let (header_count, chained_count) = {
            let index = self.core.index.read();
            (index.header_count(), index.chained_count())
        };
        let missing = self.core.missing.lock();
        ChainStatus {
            network: self.core.params.name,
            height: current.height(),
            root_hash: wire::hash_to_hex(&current.root().block_hash),
            total_work: current.total_work().to_string(),
            header_count,
            chained_count,
            missing_block_count: missing.blocks.len(),
            missing_transaction_count: missing.transactions.len(),
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        serde_json::to_value(self.status()).unwrap_or(serde_json::Value::Null)
    }
}

fn restore_best_snapshot(
    params: &ChainParameters,
    blockchains: &dyn BlockchainStore,
    transactions: &dyn Store<TransactionRecord>,
) -> Option<Blockchain> {
    let mut entries = blockchains.list_blockchains();
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    for (key, _) in entries {
        match blockchains.read_blockchain(key, transactions) {
            Ok(snapshot) if snapshot.blocks()[0].block_hash == params.genesis_hash() => {
                return Some(snapshot);
            }
            Ok(_) => warn!(key, "persisted snapshot belongs to a different network"),
            Err(err) => warn!(key, %err, "could not restore persisted snapshot"),
        }
    }
    None
}

/// True when the shutdown signal fired.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) -> bool {
    shutdown.changed().await.is_err() || *shutdown.borrow()
}

async fn chaining_worker(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = core.notify_chaining.notified() => {}
            stop = shutdown_requested(&mut shutdown) => {
                if stop {
                    break;
                }
                continue;
            }
        }
        let promoted = {
            let mut index = core.index.write();
            let mut total = 0;
            loop {
                let pass = index.chain_pass();
                total += pass;
                if pass == 0 {
                    break;
                }
            }
            total
        };
        if promoted > 0 {
            debug!(promoted, "chaining pass promoted blocks");
            core.notify_winner.notify_one();
        }
    }
}

async fn winner_worker(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = core.notify_winner.notified() => {}
            stop = shutdown_requested(&mut shutdown) => {
                if stop {
                    break;
                }
                continue;
            }
        }
        let winner = {
            let index = core.index.read();
            let invalid = core.invalid.lock();
            selector::select_winner_excluding(&index, &invalid)
        };
        if let Some(winner) = winner {
            if winner.leaf.block_hash != core.state.current().root().block_hash {
                debug!(
                    leaf = %wire::hash_to_hex(&winner.leaf.block_hash),
                    height = winner.leaf.height,
                    "winning chain differs from current snapshot"
                );
                core.notify_calc.notify_one();
            }
        }
    }
}

async fn calculator_worker(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = core.notify_calc.notified() => {}
            stop = shutdown_requested(&mut shutdown) => {
                if stop {
                    break;
                }
                continue;
            }
        }
        // Keep driving until the snapshot matches the winner or progress is
        // blocked on missing data.
        loop {
            if *shutdown.borrow() {
                return;
            }
            let winner = {
                let index = core.index.read();
                let invalid = core.invalid.lock();
                selector::select_winner_excluding(&index, &invalid)
            };
            let Some(winner) = winner else { break };
            let current = core.state.current();
            if winner.leaf.block_hash == current.root().block_hash {
                break;
            }

            let sampled_generation = core.state.generation();
            let worker_core = core.clone();
            let target_path = winner.path.clone();
            let result = tokio::task::spawn_blocking(move || {
                let ctx = CalcContext {
                    params: &worker_core.params,
                    policy: &worker_core.policy,
                    blocks: worker_core.blocks.as_ref(),
                    transactions: worker_core.transactions.as_ref(),
                };
                let cancel = worker_core.cancel.clone();
                let state = &worker_core.state;
                let mut on_progress = |_: &calculator::Progress| {
                    state.generation() == sampled_generation && !cancel.is_cancelled()
                };
                calculator::calculate(&ctx, &current, &target_path, &worker_core.cancel, &mut on_progress)
            })
            .await;

            match result {
                Ok(Ok(next)) => {
                    let height = next.height();
                    let root = wire::hash_to_hex(&next.root().block_hash);
                    if core.state.try_replace(Arc::new(next), sampled_generation) {
                        info!(height, root, "switched to winning chain");
                    } else {
                        warn!(root, "computed snapshot was superseded before install");
                    }
                }
                Ok(Err(ChainError::MissingData(missing))) => {
                    debug!(
                        blocks = missing.block_hashes.len(),
                        transactions = missing.tx_hashes.len(),
                        "calculator pass stalled on missing data"
                    );
                    core.missing.lock().record(&missing);
                    break;
                }
                Ok(Err(ChainError::Validation(reason))) => {
                    // The candidate is bad; exclude its leaf and fall back
                    // to the next-best chain on the following iteration.
                    warn!(
                        leaf = %wire::hash_to_hex(&winner.leaf.block_hash),
                        reason,
                        "winning chain failed validation; abandoning candidate"
                    );
                    core.invalid.lock().insert(winner.leaf.block_hash);
                }
                Ok(Err(ChainError::Cancelled)) => return,
                Ok(Err(ChainError::Superseded)) => {
                    debug!("calculator pass superseded; re-evaluating");
                }
                Ok(Err(err)) => {
                    error!(%err, "calculator pass failed");
                    break;
                }
                Err(join_error) => {
                    error!(%join_error, "calculator task panicked");
                    break;
                }
            }
        }
    }
}

/// Rebuild the whole current chain from genesis as a consistency self-check.
/// Any validation failure resets to the genesis snapshot: expensive and
/// blunt, trading availability for guaranteed correctness.
async fn revalidation_worker(
    core: Arc<Core>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            stop = shutdown_requested(&mut shutdown) => {
                if stop {
                    break;
                }
                continue;
            }
        }
        let current = core.state.current();
        if current.height() == 0 {
            continue;
        }
        let worker_core = core.clone();
        let snapshot = current.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let ctx = CalcContext {
                params: &worker_core.params,
                policy: &worker_core.policy,
                blocks: worker_core.blocks.as_ref(),
                transactions: worker_core.transactions.as_ref(),
            };
            let genesis = Blockchain::for_genesis(&worker_core.params);
            let cancel = worker_core.cancel.clone();
            calculator::calculate(
                &ctx,
                &genesis,
                snapshot.blocks(),
                &cancel,
                &mut |_| true,
            )
        })
        .await;

        match outcome {
            Ok(Ok(rebuilt)) => {
                if rebuilt.utxo() == current.utxo() {
                    debug!(height = current.height(), "revalidation passed");
                } else {
                    error!("revalidation found divergent UTXO state; resetting to genesis");
                    reset_to_genesis(&core);
                }
            }
            Ok(Err(ChainError::Validation(reason))) => {
                error!(reason, "current snapshot failed revalidation; resetting to genesis");
                reset_to_genesis(&core);
            }
            Ok(Err(ChainError::MissingData(missing))) => {
                debug!(
                    blocks = missing.block_hashes.len(),
                    "revalidation skipped: data not locally available"
                );
                core.missing.lock().record(&missing);
            }
            Ok(Err(ChainError::Cancelled)) => return,
            Ok(Err(err)) => warn!(%err, "revalidation pass failed"),
            Err(join_error) => error!(%join_error, "revalidation task panicked"),
        }
    }
}

fn reset_to_genesis(core: &Arc<Core>) {
    let genesis = Blockchain::for_genesis(&core.params);
    core.state.replace(Arc::new(genesis));
    core.invalid.lock().clear();
    // Rebuild forward from scratch.
    core.notify_calc.notify_one();
}

async fn persistence_worker(
    core: Arc<Core>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_persisted_root: Option<Hash> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            stop = shutdown_requested(&mut shutdown) => {
                if stop {
                    break;
                }
                continue;
            }
        }
        let current = core.state.current();
        if last_persisted_root == Some(current.root().block_hash) {
            continue;
        }
        match persist_snapshot(&core, &current) {
            Ok(key) => {
                debug!(key, height = current.height(), "persisted chain snapshot");
                last_persisted_root = Some(current.root().block_hash);
            }
            Err(err) => warn!(err = %format!("{err:#}"), "snapshot persistence failed"),
        }
    }
}

fn persist_snapshot(core: &Arc<Core>, current: &Arc<Blockchain>) -> anyhow::Result<u64> {
    let key = core
        .blockchains
        .write_blockchain(current)
        .context("writing snapshot")?;
    // Older, lower-work snapshots are garbage once a better one is durable.
    core.blockchains.remove_blockchains_below(current.total_work());
    Ok(key)
}
