// src/main.rs
use clap::Parser;
use cn_miner_rs::miner::{CryptoNight, MinerEvent, MiningCoordinator, Scratchpad};
use cn_miner_rs::utils::logging::init_bench_logging;
use cn_miner_rs::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main entry point for the miner
///
/// # Returns
/// - `Ok(())` on successful execution
/// - `Err(MinerError)` if any operation fails
///
/// # Flow
/// 1. Parses command line arguments
/// 2. Delegates to appropriate subcommand handler
/// 3. Propagates any errors upward
fn main() -> Result<(), MinerError> {
    let cli = cli::Commands::parse();

    match cli.action {
        cli::Action::Start(opts) => start_mining(opts),
        cli::Action::Benchmark(opts) => run_benchmark(opts),
        cli::Action::Config(opts) => generate_config(opts),
    }
}

/// Runs a mining session until it stops on its own
///
/// # Operations
/// 1. Initializes logging
/// 2. Loads configuration and applies CLI overrides
/// 3. Starts the coordinator with a stratum connector
/// 4. Sets up statistics reporting
/// 5. Logs miner events until the session ends
fn start_mining(opts: cli::StartOptions) -> Result<(), MinerError> {
    utils::init_logging();

    let mut config = config::load(&opts.config)?;
    // Apply CLI overrides
    if let Some(limit) = opts.cpu_limit {
        config.cpu_limit = limit;
    }
    if let Some(limit) = opts.batch_limit {
        config.batch_limit = limit;
    }
    config.validate()?;

    let connector = StratumConnector::new(config.stratum_options())?;
    let coordinator = Arc::new(MiningCoordinator::new(
        config.workers.clone(),
        Arc::new(CryptoNight),
        Arc::new(connector),
        config.coordinator_options(),
    ));
    let events = coordinator.events();
    coordinator.start_mining()?;

    // Statistics reporting
    let stop_reporting = Arc::new(AtomicBool::new(false));
    let reporter = {
        let coordinator = coordinator.clone();
        stats::StatsReporter::new(Duration::from_secs(config.report_interval_secs))
            .start_reporting(move || coordinator.stats(), stop_reporting.clone())?
    };

    for event in events.iter() {
        match event {
            MinerEvent::AcceptedResult { difficulty, worker_id } => {
                log::info!("[{}] accepted result, difficulty {}", worker_id, difficulty);
            }
            MinerEvent::DifficultyChanged { difficulty, worker_id } => {
                log::info!("[{}] difficulty now {}", worker_id, difficulty);
            }
            MinerEvent::BlockFound { worker_id } => {
                log::info!("[{}] pool found a block", worker_id);
            }
            MinerEvent::MiningError { error, worker_id, stopped } => {
                let who = worker_id.unwrap_or_else(|| "session".into());
                if stopped {
                    log::error!("[{}] {}; mining stopped", who, error);
                    break;
                }
                log::warn!("[{}] {}", who, error);
            }
        }
    }

    coordinator.stop_mining();
    stop_reporting.store(true, Ordering::Relaxed);
    if reporter.join().is_err() {
        log::error!("Stats reporter panicked");
    }
    Ok(())
}

/// Runs hash engine benchmarks
///
/// # Arguments
/// * `opts` - Benchmark configuration options
///
/// # Operations
/// 1. Initializes benchmark-specific logging
/// 2. Spawns hashing threads, each with its own scratchpad
/// 3. Collects and reports performance statistics
fn run_benchmark(opts: cli::BenchmarkOptions) -> Result<(), MinerError> {
    init_bench_logging();

    let version = opts.version;
    let engine = Arc::new(CryptoNight);
    let total = Arc::new(AtomicU64::new(0));
    let duration = Duration::from_secs(opts.duration);

    log::info!(
        "Starting {} benchmark on {} threads for {} seconds",
        version,
        opts.threads,
        opts.duration
    );

    let start_time = Instant::now();
    let handles: Vec<_> = (0..opts.threads)
        .map(|index| {
            let engine = engine.clone();
            let total = total.clone();
            std::thread::Builder::new()
                .name(format!("bench-{}", index))
                .spawn(move || -> Result<(), MinerError> {
                    let mut scratch = Scratchpad::new()?;
                    let job = Job::new("bench", benchmark_blob(version), u64::MAX, Some(version), false)?;
                    let mut blob = job.blob.clone();
                    let mut nonce = (index as u32) << 24;
                    let mut last_log = Instant::now();
                    let mut hashes = 0u64;

                    while start_time.elapsed() < duration {
                        job.write_nonce(&mut blob, nonce);
                        engine.hash(&blob, version, &mut scratch)?;
                        nonce = nonce.wrapping_add(1);
                        hashes += 1;
                        total.fetch_add(1, Ordering::Relaxed);

                        // Log progress every second
                        if last_log.elapsed().as_secs() >= 1 {
                            log::debug!(
                                "Thread {}: {:.1} H/s",
                                index,
                                hashes as f64 / last_log.elapsed().as_secs_f64()
                            );
                            hashes = 0;
                            last_log = Instant::now();
                        }
                    }
                    Ok(())
                })
        })
        .collect::<Result<_, _>>()?;

    // Wait for all threads to complete
    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(MinerError::ChannelError("Benchmark thread panicked".into())),
        }
    }

    // Report final results
    let elapsed = start_time.elapsed().as_secs_f64();
    let hashes = total.load(Ordering::Relaxed);
    let mut reporter = stats::StatsReporter::new(duration);
    let hw = reporter.get_hardware_stats();
    log::info!("Benchmark results:");
    log::info!("Total hashes: {}", hashes);
    log::info!("Average hashrate: {:.2} H/s", hashes as f64 / elapsed.max(f64::EPSILON));
    log::info!("CPU: {:.1}% | Temp: {:.1}°C", hw.cpu_usage, hw.temperature);
    log::logger().flush(); // Ensure final results appear

    Ok(())
}

/// 76-byte block header whose major version matches `version`
fn benchmark_blob(version: AlgorithmVersion) -> Vec<u8> {
    let major = match version {
        AlgorithmVersion::V0 => 6,
        AlgorithmVersion::V1 => 7,
        AlgorithmVersion::V2 => 8,
    };
    let mut blob = vec![major, major, 0xb5, 0xa2, 0xe0, 0xd8, 0x05];
    blob.resize(76, 0x5a);
    blob
}

/// Generates configuration template file
///
/// # Arguments
/// * `opts` - Configuration generation options
fn generate_config(opts: cli::ConfigOptions) -> Result<(), MinerError> {
    let config = config::generate_template();
    std::fs::write(&opts.output, config)?;
    println!("Configuration template written to {}", opts.output.display());
    Ok(())
}
