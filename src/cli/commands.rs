// src/cli/commands.rs
use crate::types::AlgorithmVersion;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CryptoNight miner CLI - weighted multi-pool CryptoNight mining in Rust
#[derive(Parser, Debug)]
#[command(name = "cn-miner-rs")]
#[command(version, about, long_about = None)]
pub struct Commands {
    /// The action to perform (start mining, run benchmarks, or generate config)
    #[command(subcommand)]
    pub action: Action,
}

/// Top-level commands for the miner application
#[derive(Subcommand, Debug)]
pub enum Action {
    /// Start mining operation with specified options
    Start(StartOptions),

    /// Measure raw hash engine throughput
    Benchmark(BenchmarkOptions),

    /// Generate configuration file template
    Config(ConfigOptions),
}

/// Options for starting the mining operation
#[derive(Parser, Debug)]
pub struct StartOptions {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// CPU capacity limit, 0.0 - 1.0 (overrides config)
    #[arg(long)]
    pub cpu_limit: Option<f64>,

    /// Batch capacity limit, 0.0 - 1.0 (overrides config)
    #[arg(long, alias = "gpu-limit")]
    pub batch_limit: Option<f64>,
}

/// Options for running hash engine benchmarks
#[derive(Parser, Debug)]
pub struct BenchmarkOptions {
    /// Algorithm version to benchmark
    #[arg(short = 'v', long = "version", id = "algorithm_version", value_enum, default_value_t = AlgorithmVersion::V2)]
    pub version: AlgorithmVersion,

    /// Duration of benchmark in seconds
    #[arg(short, long, default_value_t = 20)]
    pub duration: u64,

    /// Number of threads to use
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub threads: usize,
}

/// Options for generating configuration files
#[derive(Parser, Debug)]
pub struct ConfigOptions {
    /// Output file path
    #[arg(short, long, default_value = "config.toml")]
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_overrides_parse() {
        let cli = Commands::parse_from(["cn-miner-rs", "start", "-c", "m.toml", "--cpu-limit", "0.5", "--gpu-limit", "0.25"]);
        match cli.action {
            Action::Start(opts) => {
                assert_eq!(opts.config, PathBuf::from("m.toml"));
                assert_eq!(opts.cpu_limit, Some(0.5));
                assert_eq!(opts.batch_limit, Some(0.25));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn benchmark_takes_version_names() {
        let cli = Commands::parse_from(["cn-miner-rs", "benchmark", "--version", "v1", "-d", "3", "-t", "2"]);
        match cli.action {
            Action::Benchmark(opts) => {
                assert_eq!(opts.version, AlgorithmVersion::V1);
                assert_eq!(opts.duration, 3);
                assert_eq!(opts.threads, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
