// src/utils/error.rs
use crate::miner::backend::BackendEvent;
use serde_json;
use std::io;
use thiserror::Error;

/// Main error type for the mining engine
///
/// Covers hashing preconditions, backend resource failures, pool
/// connectivity, configuration and inter-thread communication.
#[derive(Error, Debug)]
pub enum MinerError {
    /// Errors raised by the hash engine (e.g., precondition violations)
    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    /// A job whose shape cannot be hashed safely
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Backend resource failures such as scratchpad allocation
    #[error("Backend resource error: {0}")]
    ResourceError(String),

    /// Errors related to network connectivity
    #[error("Network connection error: {0}")]
    ConnectionError(String),

    /// Errors in protocol handling or invalid protocol messages
    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    /// A submitted share was refused by the pool
    #[error("Share rejected: {0}")]
    ShareRejected(String),

    /// Session lifecycle errors (already running, no reachable workers)
    #[error("Mining session error: {0}")]
    SessionError(String),

    /// Standard I/O operation errors
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Configuration file or parameter errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Thread communication channel errors
    #[error("Thread communication error: {0}")]
    ChannelError(String),

    /// Invalid user input or parameter errors
    #[error("Invalid input: {0}")]
    InputError(String),
}

impl MinerError {
    /// Errors that cannot be recovered from by retrying
    ///
    /// A pool link failing with one of these is not reconnected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MinerError::ConfigError(_) | MinerError::SessionError(_) | MinerError::ResourceError(_)
        )
    }
}

/// Converts result-sink send failures into MinerError
///
/// Happens when a backend outlives the coordinator that was draining it.
impl From<crossbeam_channel::SendError<BackendEvent>> for MinerError {
    fn from(e: crossbeam_channel::SendError<BackendEvent>) -> Self {
        MinerError::ChannelError(format!("Backend event send failed: {}", e))
    }
}

/// Converts hex decoding errors into MinerError
///
/// Used when pools send malformed blobs or targets.
impl From<hex::FromHexError> for MinerError {
    fn from(e: hex::FromHexError) -> Self {
        MinerError::InputError(format!("Hex conversion failed: {}", e))
    }
}

/// Converts TOML parse errors into MinerError
impl From<toml::de::Error> for MinerError {
    fn from(e: toml::de::Error) -> Self {
        MinerError::ConfigError(format!("Invalid config format: {}", e))
    }
}
