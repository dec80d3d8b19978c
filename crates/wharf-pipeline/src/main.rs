//! Wharf - resumable chunked ETL runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wharf_common::logging::{init_logging, LogConfig, LogLevel};
use wharf_pipeline::config::PipelineConfig;
use wharf_pipeline::task::{build_coordinator, run_many, RunMode, TaskOutcome};

#[derive(Parser, Debug)]
#[command(name = "wharf")]
#[command(author, version, about = "Chunked, resumable extract-and-load runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) one logical run per config file
    Run {
        /// Pipeline config files; several files run concurrently
        #[arg(short, long = "config", required = true, num_args = 1..)]
        configs: Vec<PathBuf>,

        /// Logical run id; with several configs each run gets `<run-id>.<source>`
        #[arg(long)]
        run_id: String,

        /// Load into an in-memory warehouse instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the persisted state of a run
    Status {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        run_id: String,
    },

    /// Forget a run: state, staged chunks and warehouse ledger
    Reset {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        run_id: String,
    },

    /// Break the lease of a run left behind by a dead process
    Unlock {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        run_id: String,
    },

    /// Check a config file without running anything
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let log_config = LogConfig::builder().level(level).log_file_prefix("wharf").build();
    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Ignoring invalid LOG_* settings: {e}");
            log_config
        },
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        },
    };

    match execute(cli.command).await {
        Ok(true) => {},
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(1);
        },
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancel `token` on Ctrl-C; runs stop at the next chunk boundary
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl-C, stopping after the current chunk");
                token.cancel();
            },
            Err(e) => error!(error = %e, "Failed to install Ctrl-C handler"),
        }
    });
}

/// Returns whether the command fully succeeded
async fn execute(command: Command) -> Result<bool> {
    match command {
        Command::Run {
            configs,
            run_id,
            dry_run,
        } => {
            let mut runs = Vec::with_capacity(configs.len());
            for path in &configs {
                let config = load_config(path)?;
                let id = if configs.len() == 1 {
                    run_id.clone()
                } else {
                    format!("{run_id}.{}", config.source_id())
                };
                runs.push((config, id));
            }

            let mode = if dry_run { RunMode::DryRun } else { RunMode::Live };
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let mut all_succeeded = true;
            for (id, result) in run_many(&runs, mode, cancel).await {
                match result {
                    Ok(report) => {
                        all_succeeded &= TaskOutcome::from(&report).is_success();
                        print_json(&report)?;
                    },
                    Err(e) => {
                        all_succeeded = false;
                        error!(run_id = %id, error = %e, "Run failed");
                        print_json(&serde_json::json!({ "run_id": id, "error": e.to_string() }))?;
                    },
                }
            }
            Ok(all_succeeded)
        },

        Command::Status { config, run_id } => {
            let coordinator = build_coordinator(&load_config(&config)?, RunMode::Live).await?;
            match coordinator.status(&run_id).await? {
                Some(state) => print_json(&state)?,
                None => println!("No state recorded for run {run_id}"),
            }
            Ok(true)
        },

        Command::Reset { config, run_id } => {
            let coordinator = build_coordinator(&load_config(&config)?, RunMode::Live).await?;
            coordinator.reset(&run_id).await?;
            info!(run_id = %run_id, "Run reset");
            Ok(true)
        },

        Command::Unlock { config, run_id } => {
            let coordinator = build_coordinator(&load_config(&config)?, RunMode::Live).await?;
            if coordinator.force_unlock(&run_id).await? {
                println!("Released lease of run {run_id}");
            } else {
                println!("Run {run_id} was not locked");
            }
            Ok(true)
        },

        Command::Validate { config } => {
            let config = load_config(&config)?;
            println!(
                "Config OK: {} source {:?} -> {} ({})",
                config.source.kind.as_str(),
                config.source_id(),
                config.target.qualified_name(),
                config.load.strategy
            );
            Ok(true)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_accepts_several_configs() {
        let cli = Cli::try_parse_from(["wharf", "run", "-c", "a.toml", "b.toml", "--run-id", "n1"]).unwrap();
        match cli.command {
            Command::Run { configs, run_id, dry_run } => {
                assert_eq!(configs.len(), 2);
                assert_eq!(run_id, "n1");
                assert!(!dry_run);
            },
            other => panic!("unexpected command {other:?}"),
        }
    }
}
