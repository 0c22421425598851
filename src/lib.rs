//! CryptoNight Miner - multi-pool CryptoNight mining in Rust
//!
//! This crate provides a complete CryptoNight proof-of-work miner with support for:
//! - The CryptoNight slow hash, versions 0, 1 and 2
//! - CPU and batched hashing backends with fractional capacity limits
//! - Several pool accounts at once, with capacity split by weight
//! - Performance benchmarking
//! - Hardware monitoring

#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Miner core implementation including the hash engine, backends and coordination
pub mod miner;

/// Pool connection contract and the stratum client
pub mod network;

/// Statistics collection and reporting functionality
pub mod stats;

/// Utility functions and error handling
pub mod utils;

/// Command-line interface definitions
pub mod cli;

/// Configuration management
pub mod config;

/// Shared type definitions
pub mod types;

// Core exports
pub use cli::Commands;
pub use config::Config;
pub use miner::{
    Algorithm, CryptoNight, Job, MinerEvent, MiningCoordinator, NonceAllocator, Scratchpad,
    SessionState, Worker,
};
pub use network::{LoopbackPool, PoolConnector, StratumConnector};
pub use stats::{HardwareStats, MiningStats, StatsReporter};
pub use types::{AlgorithmVersion, Hash};
pub use utils::{MinerError, init_logging};
