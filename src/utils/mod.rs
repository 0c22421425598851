// src/utils/mod.rs
//! Error handling and logging shared by every module

/// Error types
///
/// Contains the [`MinerError`] enum used across the crate.
pub mod error;

/// Logging initialisation for the binary
pub mod logging;

pub use error::MinerError;
pub use logging::init_logging;
