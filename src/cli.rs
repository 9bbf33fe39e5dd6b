//! CLI struct definitions for the verdict command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use crate::core::store::DEFAULT_STORE_DIR;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "verdict",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inspect, export and independently verify a hash-chained decision ledger."
)]
pub(crate) struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[clap(long, global = true)]
    pub log_json: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Audit ledger operations
    Ledger(LedgerCli),
    /// Export document operations
    Export(ExportCli),
    /// Configuration checks
    Config(ConfigCli),
    /// Print the pseudonymous case reference for a raw identifier
    CaseRef {
        /// Raw identifier (never stored)
        #[clap(long)]
        id: String,
        /// Site-specific salt
        #[clap(long)]
        salt: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
pub(crate) struct LedgerCli {
    /// Store directory holding ledger.db.
    #[clap(long, default_value = DEFAULT_STORE_DIR)]
    pub root: PathBuf,
    #[clap(subcommand)]
    pub command: LedgerCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum LedgerCommand {
    /// Walk the ledger from genesis and recompute every entry hash
    Verify {
        /// Output format: 'text' or 'json'.
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Write a self-contained ledger export
    Export {
        /// Destination file
        #[clap(long)]
        out: PathBuf,
        /// First sequence id (default 1)
        #[clap(long)]
        from: Option<u64>,
        /// Last sequence id (default: ledger length)
        #[clap(long)]
        to: Option<u64>,
    },
    /// Show recent entries for one case
    History {
        /// Pseudonymous case reference
        #[clap(long = "case")]
        case_reference: String,
        #[clap(long, default_value_t = 50)]
        limit: u32,
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show backend fallback events
    Fallbacks {
        /// Aggregate per primary model instead of listing events
        #[clap(long)]
        stats: bool,
        #[clap(long, default_value_t = 50)]
        limit: u32,
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ExportCli {
    #[clap(subcommand)]
    pub command: ExportCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ExportCommand {
    /// Re-verify a run or ledger export from the document alone
    Verify {
        #[clap(long)]
        file: PathBuf,
        #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ConfigCli {
    #[clap(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ConfigCommand {
    /// Parse and validate a verdict.toml
    Check {
        #[clap(long)]
        file: PathBuf,
    },
    /// Print the built-in four-stage configuration as TOML
    Default,
}
