// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::manifest::default_manifest_path;

/// Command-line arguments for `launchvisor`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "launchvisor",
    version,
    about = "Start and supervise services described by a manifest.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the manifest (TOML).
    ///
    /// Default: `$LAUNCHVISOR_MANIFEST`, then `Launchvisor.toml` in the
    /// current working directory.
    #[arg(long, global = true, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LAUNCHVISOR_LOG` (filter directives) or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Validate the manifest against the current environment and print
    /// every violation. Starts nothing.
    Validate,

    /// Print the start order and per-service settings. Starts nothing.
    Plan,

    /// Start services and supervise them until Ctrl-C.
    Up {
        /// Start only these services (plus their dependencies). Repeatable.
        #[arg(long = "service", value_name = "ID")]
        services: Vec<String>,

        /// Serve the read-only status endpoint on this address,
        /// e.g. `127.0.0.1:7070`.
        #[arg(long, value_name = "ADDR")]
        status_addr: Option<String>,
    },
}

impl CliArgs {
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest.clone().unwrap_or_else(default_manifest_path)
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
