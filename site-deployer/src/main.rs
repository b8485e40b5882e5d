//! Site Deployer - Main entry point
//!
//! Differential deployment of a static site build to a remote store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use site_deployer::{config::Config, daemon::shutdown::ShutdownCoordinator, remote, utils, DeployCoordinator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one deployment cycle (default)
    Deploy,

    /// Show what the next cycle would upload and delete
    Plan {
        /// Write the plan as JSON to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Print the manifest of the current build root
    Manifest {
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Run the asset completeness gate only
    Verify,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting site-deployer v{}", env!("CARGO_PKG_VERSION"));

    let store = remote::from_config(&config.remote, config.transfer.op_timeout());
    let shutdown = ShutdownCoordinator::new();
    let coordinator = DeployCoordinator::new(&config, store)?.with_cancel(shutdown.token());

    match args.command.unwrap_or(Command::Deploy) {
        Command::Deploy => {
            tracing::info!(
                "Deploying {} to {}",
                config.site.build_root.display(),
                config.remote.target_dir
            );

            let token = shutdown.token();
            let signals = tokio::spawn(async move { shutdown.wait_for_signal().await });

            let outcome = coordinator.run_cycle().await;

            // Release the signal listener
            token.cancel();
            let _ = signals.await;

            let report = outcome?;
            Ok(ExitCode::from(report.exit_code() as u8))
        }
        Command::Plan { output } => {
            let plan = coordinator.plan().await?;
            tracing::info!(
                "Plan: {} upload(s), {} delete(s), {} unchanged",
                plan.uploads.len(),
                plan.deletes.len(),
                plan.summary.unchanged
            );
            emit(&serde_json::to_string_pretty(&plan)?, output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Manifest { output } => {
            let manifest = coordinator.current_manifest().await?;
            emit(&manifest.to_json_pretty()?, output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify => {
            let result = coordinator.verify_assets().await?;
            if result.threshold_met {
                Ok(ExitCode::SUCCESS)
            } else {
                for missing in &result.failures {
                    tracing::warn!("Missing: {}", missing);
                }
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn emit(json: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
