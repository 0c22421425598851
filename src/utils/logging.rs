// src/utils/logging.rs
//! Logging setup for the miner binary
//!
//! Library code only talks to the `log` facade; the binary picks one of the
//! initialisers below. Both honour `RUST_LOG` when it is set.

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::env;

/// Initializes logging for mining sessions
///
/// Default level is Info. Calling it twice is harmless.
pub fn init_logging() {
    init_with_default(LevelFilter::Info);
}

/// Initializes logging for benchmarks, where per-thread rates are logged at Debug
pub fn init_bench_logging() {
    init_with_default(LevelFilter::Debug);
}

fn init_with_default(level: LevelFilter) {
    let mut builder = common_log_config();

    if env::var("RUST_LOG").is_err() {
        builder.filter_level(level);
    } else {
        builder.parse_env("RUST_LOG");
    }

    // A second initialisation (tests, embedding apps) keeps the first logger.
    let _ = builder.try_init();
}

/// Base builder: `[ts level module:line] message` on stdout
fn common_log_config() -> Builder {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.module_path().unwrap_or_default(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .target(Target::Stdout);

    builder
}
