//! The blockchain calculator: reorganizing the UTXO set between chains
//!
//! Given the current snapshot and a target leaf's ancestor path, compute the
//! minimal rollback/advance sequence that lands the UTXO set at the target,
//! validating every advanced block along the way. A run moves through
//! `FindingForkPoint -> RollingBack -> Advancing` and ends in exactly one of:
//! success (a brand-new snapshot), validation failure, missing data,
//! cancellation or supersession. Every non-success outcome leaves the prior
//! snapshot untouched; the working copy is simply discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::economic;
use crate::error::{ChainError, MissingData, Result};
use crate::merkle;
use crate::params::{ChainParameters, ValidationPolicy};
use crate::pow;
use crate::script;
use crate::snapshot::{Blockchain, UtxoSet};
use crate::storage::{Store, TransactionRecord};
use crate::transaction;
use crate::types::{Block, ChainedBlock, Hash, OutputStates, Transaction, UnspentTx};
use crate::wire;

/// Cooperative cancellation flag, checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ChainError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculatorPhase {
    FindingForkPoint,
    RollingBack,
    Advancing,
}

/// Reported after the fork point is found and after every block processed,
/// so long rebuilds can be observed, checkpointed and cancelled
/// incrementally. Returning false from the progress callback aborts the run
/// as superseded.
#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: CalculatorPhase,
    /// Height of the working snapshot after this step.
    pub height: u64,
    pub block_hash: Hash,
}

/// Everything a calculator pass reads: rule inputs and the data stores.
pub struct CalcContext<'a> {
    pub params: &'a ChainParameters,
    pub policy: &'a ValidationPolicy,
    pub blocks: &'a dyn Store<Block>,
    pub transactions: &'a dyn Store<TransactionRecord>,
}

/// Transform `current` into a new snapshot rooted at the last entry of
/// `target_path` (the full genesis-to-leaf path of the winning chain).
pub fn calculate(
    ctx: &CalcContext,
    current: &Blockchain,
    target_path: &[ChainedBlock],
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(&Progress) -> bool,
) -> Result<Blockchain> {
    let target_leaf = target_path
        .last()
        .ok_or_else(|| ChainError::validation("empty target path"))?;
    if target_path[0].block_hash != current.blocks()[0].block_hash {
        return Err(ChainError::validation(
            "target path does not share this chain's genesis",
        ));
    }

    // Fork point: walk back by height until the hashes agree.
    let fork_height = find_fork_height(current, target_path)?;
    let progress = Progress {
        phase: CalculatorPhase::FindingForkPoint,
        height: fork_height,
        block_hash: target_path[fork_height as usize].block_hash,
    };
    if !on_progress(&progress) {
        return Err(ChainError::Superseded);
    }

    let (mut blocks, mut utxo) = current.clone().into_parts();

    // Rollback phase: undo the current chain down to the fork point, in
    // descending height order.
    while blocks.len() as u64 - 1 > fork_height {
        cancel.check()?;
        let chained = blocks
            .last()
            .cloned()
            .ok_or_else(|| ChainError::structural("rollback emptied the chain"))?;
        let block = ctx.blocks.try_get(&chained.block_hash).ok_or_else(|| {
            ChainError::MissingData(MissingData::block(chained.block_hash).at_height(chained.height))
        })?;
        rollback_block(ctx, &mut utxo, &block, &chained)?;
        blocks.pop();
        debug!(
            hash = %wire::hash_to_hex(&chained.block_hash),
            height = chained.height,
            "rolled back block"
        );
        let progress = Progress {
            phase: CalculatorPhase::RollingBack,
            height: chained.height - 1,
            block_hash: chained.previous_block_hash,
        };
        if !on_progress(&progress) {
            return Err(ChainError::Superseded);
        }
    }

    // Advance phase: validate then apply each target block in ascending
    // height order. Any validation failure aborts the whole operation; no
    // partial chain is ever published.
    for chained in &target_path[(fork_height + 1) as usize..] {
        cancel.check()?;
        let block = ctx.blocks.try_get(&chained.block_hash).ok_or_else(|| {
            ChainError::MissingData(
                MissingData::block(chained.block_hash).at_height(blocks.len() as u64 - 1),
            )
        })?;
        connect_block(ctx, &mut utxo, &block, chained)?;
        blocks.push(chained.clone());
        let progress = Progress {
            phase: CalculatorPhase::Advancing,
            height: chained.height,
            block_hash: chained.block_hash,
        };
        if !on_progress(&progress) {
            return Err(ChainError::Superseded);
        }
    }

    let result = Blockchain::new(blocks, utxo)?;
    info!(
        height = result.height(),
        root = %wire::hash_to_hex(&result.root().block_hash),
        "computed chain snapshot"
    );
    debug_assert_eq!(result.root().block_hash, target_leaf.block_hash);
    Ok(result)
}

fn find_fork_height(current: &Blockchain, target_path: &[ChainedBlock]) -> Result<u64> {
    let max_common = current.height().min(target_path.len() as u64 - 1);
    for height in (0..=max_common).rev() {
        let ours = current
            .block_at(height)
            .ok_or_else(|| ChainError::structural("height gap in current snapshot"))?;
        if ours.block_hash == target_path[height as usize].block_hash {
            return Ok(height);
        }
    }
    Err(ChainError::validation(
        "no common ancestor between current chain and target",
    ))
}

/// Undo one block: remove the outputs its transactions created and restore
/// the outputs they consumed. Transactions are processed in reverse so that
/// intra-block spends unwind cleanly.
fn rollback_block(
    ctx: &CalcContext,
    utxo: &mut UtxoSet,
    block: &Block,
    chained: &ChainedBlock,
) -> Result<()> {
    if block.hash() != chained.block_hash {
        return Err(ChainError::validation(
            "block data does not match the chained hash during rollback",
        ));
    }
    for tx in block.transactions.iter().rev() {
        let tx_hash = tx.hash();
        utxo.remove_tx(&tx_hash)?;
        if tx.is_coinbase() {
            continue;
        }
        for input in &tx.inputs {
            let record = ctx
                .transactions
                .try_get(&input.prev_output.tx_hash)
                .ok_or_else(|| {
                    ChainError::MissingData(
                        MissingData::transaction(input.prev_output.tx_hash)
                            .at_height(chained.height),
                    )
                })?;
            utxo.restore(&input.prev_output, || UnspentTx {
                block_hash: record.block_hash,
                tx_index: record.tx_index,
                tx_hash: input.prev_output.tx_hash,
                output_states: OutputStates::all_spent(record.transaction.outputs.len()),
            })?;
        }
    }
    Ok(())
}

/// Validate one block against the evolving UTXO set and apply it.
fn connect_block(
    ctx: &CalcContext,
    utxo: &mut UtxoSet,
    block: &Block,
    chained: &ChainedBlock,
) -> Result<()> {
    if block.hash() != chained.block_hash {
        return Err(ChainError::validation(
            "block data does not match the chained hash",
        ));
    }
    pow::check_proof_of_work(&block.header, ctx.params.highest_target_bits)?;

    let tx_hashes: Vec<Hash> = block.transactions.iter().map(Transaction::hash).collect();
    if merkle::merkle_root(&tx_hashes) != block.header.merkle_root {
        return Err(ChainError::validation(format!(
            "merkle root mismatch in block {}",
            wire::hash_to_hex(&chained.block_hash)
        )));
    }

    let Some(coinbase) = block.transactions.first() else {
        return Err(ChainError::validation("block has no transactions"));
    };
    if !coinbase.is_coinbase() {
        return Err(ChainError::validation("first transaction is not a coinbase"));
    }

    let mut total_fees = 0i64;
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        transaction::check_transaction(tx)?;

        if tx_index == 0 {
            // The coinbase has no inputs to resolve; its value is checked
            // against fees + subsidy once the fees are known.
        } else {
            if tx.is_coinbase() {
                return Err(ChainError::validation(format!(
                    "unexpected coinbase at index {tx_index}"
                )));
            }
            total_fees = total_fees.saturating_add(connect_transaction(ctx, utxo, tx)?);
        }

        utxo.insert_tx(UnspentTx {
            block_hash: chained.block_hash,
            tx_index: tx_index as u32,
            tx_hash: tx_hashes[tx_index],
            output_states: OutputStates::all_unspent(tx.outputs.len()),
        })?;
    }

    let coinbase_value: i64 = coinbase.outputs.iter().map(|output| output.value).sum();
    economic::check_coinbase_value(coinbase_value, total_fees, chained.height)?;
    Ok(())
}

/// Spend a transaction's inputs against the UTXO set, verifying each
/// unlocking script against the output it consumes. Returns the fee.
fn connect_transaction(ctx: &CalcContext, utxo: &mut UtxoSet, tx: &Transaction) -> Result<i64> {
    let mut input_value = 0i64;
    for (input_index, input) in tx.inputs.iter().enumerate() {
        // Existence, unspentness and intra-block double spends are all
        // enforced here; the working copy is discarded on failure, so it is
        // safe to mark the spend before the script runs.
        utxo.spend(&input.prev_output)?;

        let record = ctx
            .transactions
            .try_get(&input.prev_output.tx_hash)
            .ok_or_else(|| ChainError::missing_transaction(input.prev_output.tx_hash))?;
        let prev_output = record
            .transaction
            .outputs
            .get(input.prev_output.output_index as usize)
            .ok_or_else(|| {
                ChainError::validation(format!(
                    "input {input_index} references out-of-range output {}:{}",
                    wire::hash_to_hex(&input.prev_output.tx_hash),
                    input.prev_output.output_index
                ))
            })?;

        script::verify_transaction_input(
            tx,
            input_index,
            &prev_output.script_public_key,
            ctx.policy,
        )?;
        input_value = input_value.saturating_add(prev_output.value);
    }

    let output_value: i64 = tx.outputs.iter().map(|output| output.value).sum();
    if output_value > input_value {
        return Err(ChainError::validation(format!(
            "outputs {output_value} exceed inputs {input_value}"
        )));
    }
    Ok(input_value - output_value)
}
