//! Command line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--verbose`) and the
//! [`Command`] subcommands (`import`, `states`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Runs photo catalog jobs from the terminal.
#[derive(Debug, Parser)]
#[command(name = "photojobs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (defaults to ./photojobs.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Imports image files into a catalog directory.
    Import {
        /// Files to import.
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Catalog directory the files are copied into.
        #[arg(long, short)]
        target: PathBuf,

        /// How to answer failures: ask, retry, ignore, ignore-all, rollback, cancel.
        #[arg(long)]
        policy: Option<String>,

        /// Pause between files in milliseconds; overrides the config file.
        #[arg(long)]
        step_delay_ms: Option<u64>,

        /// Roll the import back after this many milliseconds.
        #[arg(long)]
        rollback_after_ms: Option<u64>,

        /// Print the job summary as JSON when done.
        #[arg(long, default_value_t = false)]
        summary: bool,
    },

    /// Prints the job state transition table.
    States,
}
