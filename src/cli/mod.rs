// src/cli/mod.rs
//! Command line interface

/// Clap definitions of the subcommands and their options
pub mod commands;

pub use commands::{Action, BenchmarkOptions, Commands, ConfigOptions, StartOptions};
