// src/stats/mod.rs
//! Statistics collection and reporting module
//!
//! This module provides functionality for tracking and reporting mining statistics,
//! including:
//! - Found, accepted and rejected result counters
//! - Aggregate hash rate
//! - Hardware monitoring (CPU usage, memory, temperature)

/// Lock-free share counters and their snapshots
pub mod counters;

/// Submodule containing the statistics reporter implementation
///
/// The reporter handles:
/// - Hardware monitoring
/// - Periodic reporting of stats
pub mod reporter;

// Re-export main components
pub use counters::{MiningStats, ShareCounters, ShareResult};
pub use reporter::{HardwareStats, StatsReporter};
