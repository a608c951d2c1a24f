//! Bitcoin consensus constants

/// Maximum money supply: 21,000,000 BTC in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Maximum serialized transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum serialized block size
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum stack size during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of (non-push) operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Initial block subsidy: 50 BTC
pub const INITIAL_SUBSIDY: i64 = 50 * 100_000_000;

/// Satoshis per BTC
pub const SATOSHIS_PER_BTC: i64 = 100_000_000;

/// Mainnet maximum target (minimum difficulty), compact form
pub const MAINNET_HIGHEST_TARGET_BITS: u32 = 0x1d00ffff;

/// Regtest maximum target, compact form
pub const REGTEST_HIGHEST_TARGET_BITS: u32 = 0x207fffff;

/// Previous-output index marking a coinbase input
pub const COINBASE_OUTPUT_INDEX: u32 = 0xffff_ffff;

/// Compact varint width markers
pub const VARINT_U16_MARKER: u8 = 0xfd;
pub const VARINT_U32_MARKER: u8 = 0xfe;
pub const VARINT_U64_MARKER: u8 = 0xff;
