// src/miner/algorithm/mod.rs
//! Hash engine
//!
//! The CryptoNight slow hash and the primitives it is built from. Backends
//! reach it through the [`Algorithm`] trait so tests and benchmarks can swap
//! in other engines without touching the scheduling code.

/// AES key schedule and the non-standard pseudo rounds
pub mod aes;

/// CryptoNight slow hash and its scratchpad
pub mod cryptonight;

/// BLAKE / Groestl / JH / Skein finalizers
pub mod finalizers;

/// Keccak-1600 sponge
pub mod keccak;

use crate::types::{AlgorithmVersion, Hash};
use crate::utils::error::MinerError;

pub use cryptonight::Scratchpad;

/// Common interface for hash engines driven by backends
///
/// Implementations are pure: all mutable memory comes from the caller's
/// scratchpad, so one engine can be shared by every hashing thread.
pub trait Algorithm: Send + Sync {
    /// Hash `input` with the given algorithm version
    fn hash(
        &self,
        input: &[u8],
        version: AlgorithmVersion,
        scratch: &mut Scratchpad,
    ) -> Result<Hash, MinerError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// The CryptoNight slow-hash engine
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoNight;

impl Algorithm for CryptoNight {
    fn hash(
        &self,
        input: &[u8],
        version: AlgorithmVersion,
        scratch: &mut Scratchpad,
    ) -> Result<Hash, MinerError> {
        cryptonight::slow_hash(input, version, scratch)
    }

    fn name(&self) -> &'static str {
        "cryptonight"
    }
}
