// src/network/mod.rs
//! Pool communication
//!
//! The coordinator talks to pools through channels only:
//! - `pool`: the [`PoolConnector`] / [`PoolLink`] contract and an in-process pool
//! - `stratum`: the TCP stratum client used in production

/// Pool link contract and in-process pool
pub mod pool;

/// Line-delimited JSON-RPC stratum client
///
/// Logs in, relays jobs, submits results and reconnects with backoff.
pub mod stratum;

// Re-export main components for cleaner imports
pub use pool::{LoopbackPool, PoolCommand, PoolConnector, PoolEvent, PoolLink};
pub use stratum::{StratumConnector, StratumOptions};
