//! lifeline CLI - apply hardening tasks to a remote host with a way back
//!
//! This is the CLI binary on top of the lifeline library. The emergency
//! console lives in the separate `lifeline-rescue` binary.

mod backup_commands;
mod cli;
mod output;
mod run_commands;
mod runtime;
mod watchdog_commands;

use clap::Parser;
use cli::{Cli, Commands, WatchdogCommands};
use lifeline::Result;
use runtime::Runtime;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("lifeline: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    // The worker is detached from the terminal and only needs its session
    // directory; it must not depend on the config still being readable.
    if let Commands::Watchdog(args) = &cli.command {
        if let WatchdogCommands::RevertWorker { session } = &args.command {
            return watchdog_commands::run_watchdog_worker(session);
        }
    }

    let rt = Runtime::from_cli(&cli)?;
    match cli.command {
        Commands::RunAll(args) => run_commands::cmd_run_all(&rt, &args),
        Commands::RunOne { task, run } => run_commands::cmd_run_one(&rt, &task, &run),
        Commands::RunTier { tier, run } => run_commands::cmd_run_tier(&rt, tier, &run),
        Commands::Status { json } => run_commands::cmd_status(&rt, json),
        Commands::Recover => run_commands::cmd_recover(&rt),
        Commands::Backup(args) => backup_commands::run_backup(&rt, args),
        Commands::Watchdog(args) => watchdog_commands::run_watchdog(&rt, args),
    }
}
