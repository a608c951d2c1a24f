//! # chainstate
//!
//! A Bitcoin-protocol full-node core: block and transaction ingestion, a
//! forest of candidate chains, greatest-cumulative-work chain selection, and
//! incremental UTXO-set maintenance across reorganizations with full
//! consensus validation.
//!
//! ## Architecture
//!
//! Components in dependency order, leaves first:
//!
//! - [`wire`], [`pow`], [`merkle`] — serialization, hashing and target
//!   arithmetic primitives
//! - [`types`], [`snapshot`] — the immutable domain model and chain
//!   snapshots
//! - [`transaction`], [`script`], [`economic`] — stateless consensus rules
//! - [`index`] — linking unordered header arrival into a chained forest
//! - [`selector`] — picking the leaf with greatest cumulative work
//! - [`calculator`] — the rollback/advance state machine over the UTXO set
//! - [`daemon`] — asynchronous workers driving convergence
//!
//! Peer networking, durable storage engines and the CLI live elsewhere; the
//! [`storage`] traits are the seam they plug into.
//!
//! ## Usage
//!
//! ```no_run
//! use chainstate::daemon::{CoreDaemon, DaemonConfig};
//! use chainstate::params::{ChainParameters, ValidationPolicy};
//!
//! # async fn run() {
//! let mut daemon = CoreDaemon::new(
//!     ChainParameters::mainnet(),
//!     ValidationPolicy::default(),
//!     DaemonConfig::default(),
//! );
//! daemon.start();
//! // feed blocks from the network layer:
//! // daemon.submit_block(block);
//! let status = daemon.status();
//! println!("height {}", status.height);
//! # daemon.shutdown().await;
//! # }
//! ```

pub mod calculator;
pub mod constants;
pub mod daemon;
pub mod economic;
pub mod error;
pub mod index;
pub mod merkle;
pub mod mining;
pub mod params;
pub mod pow;
pub mod script;
pub mod selector;
pub mod snapshot;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod wire;

pub use error::{ChainError, MissingData, Result};
pub use params::{ChainParameters, ValidationPolicy};
pub use snapshot::{Blockchain, UtxoSet};
pub use types::{
    Block, BlockHeader, ChainedBlock, Hash, OutPoint, OutputStates, Transaction, TxInput,
    TxOutput, UnspentTx,
};
