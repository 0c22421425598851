// src/miner/worker.rs
//! Pool accounts
//!
//! A [`Worker`] is one configured account on one pool. It is created from
//! configuration and never changes while a session runs; the coordinator
//! binds exactly one pool connection to each.

use crate::utils::error::MinerError;
use serde::{Deserialize, Serialize};

/// A pool account mined against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique name used to tag events
    pub identifier: String,
    /// Pool hostname or address
    pub pool_host: String,
    /// Pool TCP port
    pub pool_port: u16,
    /// Connect over TLS
    #[serde(default)]
    pub secure: bool,
    /// The pool reserves the top nonce byte
    #[serde(default)]
    pub nicehash: bool,
    /// Payout address, possibly with pool suffixes
    pub wallet_address: String,
    /// Pool password (often "x")
    #[serde(default = "default_password")]
    pub password: String,
    /// Relative share of backend capacity
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_password() -> String {
    "x".into()
}

fn default_weight() -> f64 {
    1.0
}

impl Worker {
    /// Creates a plain-TCP, non-nicehash worker with weight 1
    ///
    /// # Arguments
    /// * `identifier` - Name used in events and logs
    /// * `pool_host` - Pool hostname
    /// * `pool_port` - Pool port
    /// * `wallet_address` - Login sent to the pool
    pub fn new(
        identifier: impl Into<String>,
        pool_host: impl Into<String>,
        pool_port: u16,
        wallet_address: impl Into<String>,
    ) -> Self {
        Worker {
            identifier: identifier.into(),
            pool_host: pool_host.into(),
            pool_port,
            secure: false,
            nicehash: false,
            wallet_address: wallet_address.into(),
            password: default_password(),
            weight: default_weight(),
        }
    }

    /// Sets the capacity weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the nicehash flag
    pub fn with_nicehash(mut self, nicehash: bool) -> Self {
        self.nicehash = nicehash;
        self
    }

    /// `host:port` form of the pool endpoint
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.pool_host, self.pool_port)
    }

    /// Wallet address without pool-specific suffixes
    pub fn payout_address(&self) -> &str {
        Self::base_address(&self.wallet_address)
    }

    /// Strips `.worker` and `+difficulty` style suffixes from a login
    ///
    /// ```
    /// use cn_miner_rs::miner::worker::Worker;
    /// assert_eq!(Worker::base_address("4Abc.rig1+5000"), "4Abc");
    /// assert_eq!(Worker::base_address("4Abc"), "4Abc");
    /// ```
    pub fn base_address(address: &str) -> &str {
        match address.find(['.', '+']) {
            Some(end) => &address[..end],
            None => address,
        }
    }

    /// Checks the fields needed to connect and weigh the worker
    pub fn validate(&self) -> Result<(), MinerError> {
        if self.identifier.trim().is_empty() {
            return Err(MinerError::ConfigError("Worker identifier is empty".into()));
        }
        if self.pool_host.trim().is_empty() {
            return Err(MinerError::ConfigError(format!(
                "Worker {} has no pool host",
                self.identifier
            )));
        }
        if self.pool_port == 0 {
            return Err(MinerError::ConfigError(format!(
                "Worker {} has no pool port",
                self.identifier
            )));
        }
        if self.wallet_address.trim().is_empty() {
            return Err(MinerError::ConfigError(format!(
                "Worker {} has no wallet address",
                self.identifier
            )));
        }
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(MinerError::ConfigError(format!(
                "Worker {} weight must be positive, got {}",
                self.identifier, self.weight
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_address_strips_suffixes() {
        assert_eq!(Worker::base_address("44AFFq5k.worker1"), "44AFFq5k");
        assert_eq!(Worker::base_address("44AFFq5k+20000"), "44AFFq5k");
        assert_eq!(Worker::base_address("44AFFq5k+20000.rig"), "44AFFq5k");
        assert_eq!(Worker::base_address(""), "");
    }

    #[test]
    fn validation_rejects_bad_weights() {
        let worker = Worker::new("w", "pool.example.com", 3333, "4Abc");
        assert!(worker.validate().is_ok());
        assert!(worker.clone().with_weight(0.0).validate().is_err());
        assert!(worker.clone().with_weight(f64::NAN).validate().is_err());
        let mut nameless = worker;
        nameless.identifier = " ".into();
        assert!(nameless.validate().is_err());
    }

    #[test]
    fn serde_defaults_apply() {
        let worker: Worker = toml::from_str(
            r#"
            identifier = "main"
            pool_host = "pool.example.com"
            pool_port = 3333
            wallet_address = "4Abc.rig"
            "#,
        )
        .unwrap();
        assert_eq!(worker.password, "x");
        assert_eq!(worker.weight, 1.0);
        assert!(!worker.secure && !worker.nicehash);
        assert_eq!(worker.payout_address(), "4Abc");
        assert_eq!(worker.endpoint(), "pool.example.com:3333");
    }
}
