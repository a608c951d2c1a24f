//! Block subsidy schedule and the coinbase value rule

use crate::constants::{HALVING_INTERVAL, INITIAL_SUBSIDY};
use crate::error::{ChainError, Result};

/// Subsidy at a given height: 50 BTC halved every 210,000 blocks, reaching
/// zero after 64 halvings.
pub fn get_block_subsidy(height: u64) -> i64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// The coinbase may claim at most the subsidy plus the block's total fees.
pub fn check_coinbase_value(coinbase_output_value: i64, total_fees: i64, height: u64) -> Result<()> {
    let allowed = get_block_subsidy(height).saturating_add(total_fees);
    if coinbase_output_value > allowed {
        return Err(ChainError::validation(format!(
            "coinbase claims {coinbase_output_value} but only {allowed} is available at height {height}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_schedule() {
        assert_eq!(get_block_subsidy(0), 50 * 100_000_000);
        assert_eq!(get_block_subsidy(209_999), 50 * 100_000_000);
        assert_eq!(get_block_subsidy(210_000), 25 * 100_000_000);
        assert_eq!(get_block_subsidy(420_000), 1_250_000_000);
        assert_eq!(get_block_subsidy(64 * 210_000), 0);
    }

    #[test]
    fn test_coinbase_value_rule() {
        assert!(check_coinbase_value(50 * 100_000_000, 0, 0).is_ok());
        assert!(check_coinbase_value(50 * 100_000_000 + 1, 0, 0).is_err());
        // Fees raise the allowance.
        assert!(check_coinbase_value(50 * 100_000_000 + 1, 1, 0).is_ok());
    }
}
