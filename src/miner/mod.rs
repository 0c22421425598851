// src/miner/mod.rs
//! Core mining functionality
//!
//! This module contains all components related to the mining process:
//! - The CryptoNight hash engine
//! - Jobs and nonce allocation
//! - CPU and batch hashing backends
//! - Weighted capacity assignment and the session coordinator

/// Hash engine
///
/// The CryptoNight slow hash (v0, v1, v2) and its building blocks.
pub mod algorithm;

/// Hashing backends
///
/// CPU and batch backends sharing one contract: take a job, hash nonce
/// blocks, report qualifying results and a smoothed hash rate.
pub mod backend;

/// Session coordinator
///
/// Binds workers to backends, relays jobs and results, rebalances capacity.
pub mod coordinator;

/// Mining jobs and block header parsing
pub mod job;

/// Lock-free nonce allocation
pub mod nonce;

/// Weighted capacity assignment
///
/// Splits each backend kind's limit among eligible workers by weight.
pub mod scheduler;

/// Pool account descriptors
pub mod worker;

// Re-export main components for cleaner imports
pub use self::algorithm::{Algorithm, CryptoNight, Scratchpad};
pub use self::backend::{Backend, BackendKind, BatchBackend, CpuBackend};
pub use self::coordinator::{CoordinatorOptions, MinerEvent, MiningCoordinator, SessionState};
pub use self::job::Job;
pub use self::nonce::NonceAllocator;
pub use self::scheduler::{Assignment, Scheduler};
pub use self::worker::Worker;
