//! Verdict: a verifiable multi-stage decision pipeline.
//!
//! A fixed sequence of reasoning stages runs in strict order, each stage's
//! output feeding the next. Every step is sealed into a SHA-256 hash chain and
//! every approved decision is appended to a hash-chained SQLite ledger, so any
//! retroactive edit to the recorded trail is detectable.
//!
//! # Architecture
//!
//! - [`core::canonical`](crate::core::canonical) / [`core::chain`](crate::core::chain): canonical encoding and chain walks
//! - [`core::stage`](crate::core::stage) / [`core::router`](crate::core::router): one stage call, with ordered backend fallback
//! - [`core::pipeline`](crate::core::pipeline) / [`core::confidence`](crate::core::confidence): the run state machine and final score
//! - [`core::ledger`](crate::core::ledger): append-only decision ledger (through `DbBroker`)
//! - [`core::export`](crate::core::export): self-contained documents a third party can re-verify
//!
//! # Examples
//!
//! ```bash
//! # Re-check the ledger from genesis
//! verdict ledger verify --root .verdict
//!
//! # Hand an auditor a copy, then let them check it elsewhere
//! verdict ledger export --out audit.json
//! verdict export verify --file audit.json
//! ```

mod cli;
pub mod core;

use crate::cli::{Cli, Command, ConfigCommand, ExportCommand, LedgerCommand, OutputFormat};
use crate::core::chain::ChainVerdict;
use crate::core::config::VerdictConfig;
use crate::core::error::VerdictError;
use crate::core::export::{self, ExportDocument};
use crate::core::ledger::AuditLedger;
use crate::core::store::Store;
use crate::core::{case_ref, time};

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install the global `tracing` subscriber. Logs go to stderr.
///
/// The filter comes from `VERDICT_LOG`, then `RUST_LOG`, then defaults to `warn`.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env("VERDICT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

pub fn run() -> Result<(), VerdictError> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Command::Ledger(ledger_cli) => {
            let store = Store::existing(&ledger_cli.root)?;
            let ledger = AuditLedger::open_existing(&store)?;
            run_ledger_command(&ledger, ledger_cli.command)
        }
        Command::Export(export_cli) => match export_cli.command {
            ExportCommand::Verify { file, format } => {
                let doc = export::read_export(&file)?;
                let verdict = export::verify_export(&doc);
                let kind = match doc {
                    ExportDocument::Run(_) => "run",
                    ExportDocument::Ledger(_) => "ledger",
                };
                report_verdict(&format!("export.verify.{}", kind), &verdict, format)
            }
        },
        Command::Config(config_cli) => match config_cli.command {
            ConfigCommand::Check { file } => {
                let config = VerdictConfig::load(&file)?;
                println!(
                    "{} {} ({} stages, weights {})",
                    "✓".bright_green(),
                    file.display(),
                    config.stages.len(),
                    config.confidence.version
                );
                Ok(())
            }
            ConfigCommand::Default => {
                print!("{}", VerdictConfig::default().to_toml_string()?);
                Ok(())
            }
        },
        Command::CaseRef { id, salt } => {
            println!("{}", case_ref::pseudonymize(&id, &salt)?);
            Ok(())
        }
    }
}

fn run_ledger_command(ledger: &AuditLedger, command: LedgerCommand) -> Result<(), VerdictError> {
    match command {
        LedgerCommand::Verify { format } => {
            let verdict = ledger.verify_ledger()?;
            report_verdict("ledger.verify", &verdict, format)
        }
        LedgerCommand::Export { out, from, to } => {
            let doc = export::export_ledger(ledger, from, to)?;
            let count = doc.entries.len();
            export::write_export(&out, &ExportDocument::Ledger(doc))?;
            println!(
                "{} exported {} entries to {}",
                "✓".bright_green(),
                count,
                out.display()
            );
            Ok(())
        }
        LedgerCommand::History {
            case_reference,
            limit,
            format,
        } => {
            let entries = ledger.entries_for_case(&case_reference, limit)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Text => {
                    for e in &entries {
                        println!(
                            "#{:<5} {}  {:<12} {:<6} {}",
                            e.sequence_id,
                            e.timestamp,
                            e.actor,
                            e.mode,
                            &e.entry_hash[..e.entry_hash.len().min(16)]
                        );
                    }
                }
            }
            Ok(())
        }
        LedgerCommand::Fallbacks {
            stats,
            limit,
            format,
        } => {
            if stats {
                let stats = ledger.fallback_statistics()?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                    OutputFormat::Text => {
                        for (model, s) in &stats {
                            println!(
                                "{:<24} total {:>4}  ok {:>4}  failed {:>4}",
                                model, s.total_fallbacks, s.successful_fallbacks, s.failed_fallbacks
                            );
                        }
                    }
                }
            } else {
                let events = ledger.fallback_events(limit)?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
                    OutputFormat::Text => {
                        for ev in &events {
                            let outcome = if ev.success {
                                "recovered".bright_green()
                            } else {
                                "failed".bright_red()
                            };
                            println!(
                                "{} [{}] {} -> {} {}: {}",
                                ev.timestamp,
                                ev.stage_name,
                                ev.primary_model,
                                ev.fallback_model.as_deref().unwrap_or("-"),
                                outcome,
                                ev.error_summary
                            );
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

/// Print a verdict; an invalid chain becomes the command's error.
fn report_verdict(
    cmd: &str,
    verdict: &ChainVerdict,
    format: OutputFormat,
) -> Result<(), VerdictError> {
    match format {
        OutputFormat::Json => {
            let status = if verdict.valid { "ok" } else { "failed" };
            let envelope = time::command_envelope(cmd, status, serde_json::to_value(verdict)?);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text if verdict.valid => {
            println!(
                "{} chain valid ({} records checked)",
                "✓".bright_green(),
                verdict.checked
            );
        }
        OutputFormat::Text => {}
    }
    verdict.clone().into_result().map(|_| ())
}
