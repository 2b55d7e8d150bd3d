//! Task execution subcommands

use crate::cli::RunArgs;
use crate::output::{self, prefix};
use crate::runtime::Runtime;
use colored::Colorize;
use lifeline::txn::signals;
use lifeline::{Orchestrator, Result, RunSummary};

/// Highest exit code reported for failed tasks
const MAX_FAILURE_EXIT: usize = 100;

/// 0 on success, otherwise the number of failed tasks (capped)
pub fn exit_code(summary: &RunSummary) -> i32 {
    if summary.is_success() {
        return 0;
    }
    let failures = summary.failure_count().clamp(1, MAX_FAILURE_EXIT);
    i32::try_from(failures).unwrap_or(1)
}

pub fn cmd_run_all(rt: &Runtime, args: &RunArgs) -> Result<i32> {
    run_with(rt, args, |orch| orch.run_all())
}

pub fn cmd_run_one(rt: &Runtime, task: &str, args: &RunArgs) -> Result<i32> {
    run_with(rt, args, |orch| orch.run_one(task))
}

pub fn cmd_run_tier(rt: &Runtime, tier: u32, args: &RunArgs) -> Result<i32> {
    run_with(rt, args, |orch| orch.run_tier(tier))
}

fn run_with<F>(rt: &Runtime, args: &RunArgs, run: F) -> Result<i32>
where
    F: FnOnce(&mut Orchestrator) -> Result<RunSummary>,
{
    output::print_banner(rt.silent, rt.dry_run);
    signals::install_termination_handlers();

    let mut orch = rt.orchestrator(args.fail_fast_override())?;

    if args.snapshot {
        if rt.dry_run {
            eprintln!("{} [dry-run] would take a snapshot first", prefix());
        } else {
            let info = orch
                .engine()
                .store()
                .create_snapshot(None, &rt.config.snapshot)?;
            if !rt.silent {
                eprintln!(
                    "{} Snapshot {} ({} files, {} states)",
                    prefix(),
                    info.id.bold(),
                    info.files.len(),
                    info.states.len()
                );
            }
        }
    }

    let summary = run(&mut orch)?;
    output::print_run_summary(&summary, rt.silent);
    Ok(exit_code(&summary))
}

pub fn cmd_status(rt: &Runtime, json: bool) -> Result<i32> {
    let orch = rt.orchestrator(None)?;
    let tasks = orch.status();

    if json {
        let rows: Vec<serde_json::Value> = tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "tier": t.tier,
                    "depends_on": t.depends_on,
                    "state": t.state.label(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
        );
        return Ok(0);
    }

    output::print_task_table(&tasks);
    Ok(0)
}

pub fn cmd_recover(rt: &Runtime) -> Result<i32> {
    let mut engine = rt.engine()?;
    match engine.recover_interrupted()? {
        None => {
            eprintln!("{} No interrupted transaction to recover.", prefix());
            Ok(0)
        }
        Some(report) => {
            eprintln!(
                "{} Recovered transaction {}",
                prefix(),
                report.transaction.as_deref().unwrap_or("(unnamed)").bold()
            );
            output::print_rollback_report(&report);
            Ok(if report.is_clean() { 0 } else { 1 })
        }
    }
}
