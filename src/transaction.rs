//! Structural transaction validation

use crate::constants::{MAX_MONEY, MAX_TX_SIZE};
use crate::error::{ChainError, Result};
use crate::types::Transaction;
use crate::wire;

/// Context-free structural checks on a single transaction:
/// 1. at least one input and one output
/// 2. every output value within [0, MAX_MONEY], as is the total
/// 3. serialized size within the transaction size limit
/// 4. no duplicate previous output within the inputs
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ChainError::validation("transaction has no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(ChainError::validation("transaction has no outputs"));
    }

    let mut total: i64 = 0;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 || output.value > MAX_MONEY {
            return Err(ChainError::validation(format!(
                "output {index} value {} out of range",
                output.value
            )));
        }
        total = total.saturating_add(output.value);
        if total > MAX_MONEY {
            return Err(ChainError::validation("total output value out of range"));
        }
    }

    let size = wire::serialize_transaction(tx).len();
    if size > MAX_TX_SIZE {
        return Err(ChainError::validation(format!(
            "transaction of {size} bytes exceeds the {MAX_TX_SIZE}-byte limit"
        )));
    }

    if !tx.is_coinbase() {
        for (index, input) in tx.inputs.iter().enumerate() {
            let duplicated = tx.inputs[..index]
                .iter()
                .any(|earlier| earlier.prev_output == input.prev_output);
            if duplicated {
                return Err(ChainError::validation(format!(
                    "input {index} repeats a previous output within the transaction"
                )));
            }
        }
    }

    Ok(())
}
