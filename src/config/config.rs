// src/config/config.rs
use crate::{
    miner::{
        backend::BackendOptions,
        coordinator::CoordinatorOptions,
        worker::Worker,
    },
    network::stratum::StratumOptions,
    utils::error::MinerError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the mining application
///
/// Session-wide capacity limits and tuning plus the list of pool accounts
/// (workers) to mine for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Fraction of the CPU to use (0..=1)
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Fraction of the batch hashing resource to use (0..=1)
    #[serde(default, alias = "gpu_limit")]
    pub batch_limit: f64,

    /// Hashing threads at full CPU capacity
    /// (default: number of CPU cores)
    #[serde(default = "default_threads")]
    pub cpu_threads: usize,

    /// Lanes per batch dispatch
    /// (default: number of CPU cores)
    #[serde(default = "default_threads")]
    pub batch_lanes: usize,

    /// Nonces reserved per allocation
    /// (default: 16)
    #[serde(default = "default_nonce_block")]
    pub nonce_block: u32,

    /// Seconds without pool activity before a worker loses its capacity
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Milliseconds between eligibility checks
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval_ms: u64,

    /// Seconds between statistics log lines
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Consecutive failed connections before a pool link gives up
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    /// Pool accounts
    #[serde(default)]
    pub workers: Vec<Worker>,
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_nonce_block() -> u32 {
    16
}

fn default_stall_timeout() -> u64 {
    300
}

fn default_rebalance_interval() -> u64 {
    1000
}

fn default_report_interval() -> u64 {
    60
}

fn default_max_reconnects() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cpu_limit: default_cpu_limit(),
            batch_limit: 0.0,
            cpu_threads: default_threads(),
            batch_lanes: default_threads(),
            nonce_block: default_nonce_block(),
            stall_timeout_secs: default_stall_timeout(),
            rebalance_interval_ms: default_rebalance_interval(),
            report_interval_secs: default_report_interval(),
            max_reconnects: default_max_reconnects(),
            workers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Ok(Config)` - Successfully loaded and validated configuration
    /// * `Err(MinerError)` - If file couldn't be read, parsed or validated
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, MinerError> {
        let path = path.into();
        let config_str = std::fs::read_to_string(&path).map_err(|e| {
            MinerError::ConfigError(format!(
                "Failed to read config at {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks limits, tuning values and workers
    pub fn validate(&self) -> Result<(), MinerError> {
        for (name, limit) in [("cpu_limit", self.cpu_limit), ("batch_limit", self.batch_limit)] {
            if !(0.0..=1.0).contains(&limit) {
                return Err(MinerError::ConfigError(format!(
                    "{} must be between 0 and 1, got {}",
                    name, limit
                )));
            }
        }
        if self.nonce_block == 0 {
            return Err(MinerError::ConfigError("nonce_block must be positive".into()));
        }
        if self.cpu_threads == 0 || self.batch_lanes == 0 {
            return Err(MinerError::ConfigError(
                "cpu_threads and batch_lanes must be positive".into(),
            ));
        }
        if self.rebalance_interval_ms == 0 {
            return Err(MinerError::ConfigError("rebalance_interval_ms must be positive".into()));
        }
        if self.workers.is_empty() {
            return Err(MinerError::ConfigError("At least one [[workers]] entry is required".into()));
        }
        let mut ids = HashSet::new();
        for worker in &self.workers {
            worker.validate()?;
            if !ids.insert(worker.identifier.as_str()) {
                return Err(MinerError::ConfigError(format!(
                    "Duplicate worker identifier {}",
                    worker.identifier
                )));
            }
        }
        Ok(())
    }

    /// Coordinator settings derived from this configuration
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let backend = |max_threads| BackendOptions {
            nonce_block: self.nonce_block,
            max_threads,
            ..BackendOptions::default()
        };
        CoordinatorOptions {
            cpu_limit: self.cpu_limit,
            batch_limit: self.batch_limit,
            cpu: backend(self.cpu_threads),
            batch: backend(self.batch_lanes),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            rebalance_interval: Duration::from_millis(self.rebalance_interval_ms),
        }
    }

    /// Stratum link settings derived from this configuration
    pub fn stratum_options(&self) -> StratumOptions {
        StratumOptions {
            max_reconnects: self.max_reconnects,
            ..StratumOptions::default()
        }
    }

    /// Generates a configuration template string
    ///
    /// # Returns
    /// String containing a commented TOML configuration template
    pub fn generate_template() -> String {
        let mut template = String::new();
        template.push_str("# CryptoNight Miner Configuration\n\n");
        template.push_str("# Share of the CPU to mine with (0.0 - 1.0)\n");
        template.push_str("cpu_limit = 1.0\n");
        template.push_str("# Share of the batch hashing pool to mine with (0.0 - 1.0)\n");
        template.push_str("batch_limit = 0.0\n");
        template.push_str("# Nonces reserved per allocation\n");
        template.push_str("nonce_block = 16\n");
        template.push_str("# Seconds without pool activity before a worker's capacity is reassigned\n");
        template.push_str("stall_timeout_secs = 300\n");
        template.push_str("# Milliseconds between capacity rebalancing checks\n");
        template.push_str("rebalance_interval_ms = 1000\n");
        template.push_str("# Seconds between statistics log lines\n");
        template.push_str("report_interval_secs = 60\n\n");

        template.push_str("# One entry per pool account; capacity is split by weight\n");
        template.push_str("[[workers]]\n");
        template.push_str("identifier = \"main\"\n");
        template.push_str("pool_host = \"pool.example.com\"\n");
        template.push_str("pool_port = 3333\n");
        template.push_str("secure = false\n");
        template.push_str("nicehash = false\n");
        template.push_str("wallet_address = \"your_wallet_address\"\n");
        template.push_str("password = \"x\"\n");
        template.push_str("weight = 1.0\n");

        template
    }
}
