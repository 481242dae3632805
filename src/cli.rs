// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for the `jobvisor` worker.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobvisor",
    version,
    about = "Build tasks and supervise scheduled job runs.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Jobvisor.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Jobvisor.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `JOBVISOR_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config and print it, but don't start the worker.
    #[arg(long)]
    pub dry_run: bool,

    /// Don't read front messages from stdin.
    #[arg(long)]
    pub no_stdin: bool,
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

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
