//! Control-channel watchdog subcommands

use crate::cli::{WatchdogArgs, WatchdogCommands};
use crate::output::prefix;
use crate::runtime::Runtime;
use colored::Colorize;
use lifeline::watchdog::{run_worker, ArmedStatus, CancelOutcome, WorkerOutcome};
use lifeline::Result;
use std::path::Path;
use tracing::{info, warn};

/// Dispatch to the appropriate watchdog subcommand.
pub fn run_watchdog(rt: &Runtime, args: WatchdogArgs) -> Result<i32> {
    match args.command {
        WatchdogCommands::Validate { candidate } => cmd_validate(rt, &candidate),
        WatchdogCommands::Test { candidate } => cmd_test(rt, &candidate),
        WatchdogCommands::Arm { candidate, timeout } => cmd_arm(rt, &candidate, timeout),
        WatchdogCommands::Confirm => cmd_confirm(rt),
        WatchdogCommands::Cancel => cmd_cancel(rt),
        WatchdogCommands::Status { json } => cmd_status(rt, json),
        WatchdogCommands::RevertWorker { session } => run_watchdog_worker(&session),
    }
}

fn cmd_validate(rt: &Runtime, candidate: &Path) -> Result<i32> {
    rt.watchdog()?.validate_syntax(candidate)?;
    eprintln!("{} {} is valid", prefix(), candidate.display());
    Ok(0)
}

fn cmd_test(rt: &Runtime, candidate: &Path) -> Result<i32> {
    let watchdog = rt.watchdog()?;
    watchdog.validate_syntax(candidate)?;
    let banner = watchdog.test_parallel_instance(candidate)?;
    eprintln!(
        "{} Test instance on {} answered: {}",
        prefix(),
        watchdog.channel().alt_address,
        banner.truecolor(150, 150, 150)
    );
    Ok(0)
}

fn cmd_arm(rt: &Runtime, candidate: &Path, timeout: Option<u64>) -> Result<i32> {
    let watchdog = rt.watchdog()?;
    let timeout = timeout.unwrap_or(watchdog.channel().revert_timeout_secs);

    watchdog.validate_syntax(candidate)?;
    watchdog.test_parallel_instance(candidate)?;
    if rt.dry_run {
        eprintln!(
            "{} [dry-run] {} passed validation and the parallel test; not arming",
            prefix(),
            candidate.display()
        );
        return Ok(0);
    }

    let mut engine = rt.engine()?;
    let session = watchdog.arm(&mut engine, candidate, timeout)?;

    eprintln!(
        "{} Armed session {}: {} is live",
        prefix(),
        session.id.bold(),
        watchdog.channel().config_path.display()
    );
    eprintln!(
        "{} It will be reverted at {} unless confirmed.",
        prefix(),
        session.deadline().format("%H:%M:%S UTC").to_string().yellow()
    );
    eprintln!();
    eprintln!("  Open a NEW session to this host, then run:");
    eprintln!("    {}", "lifeline watchdog confirm".bold());
    eprintln!("  Keep this session open until you have confirmed.");
    Ok(0)
}

fn report_cancel(outcome: CancelOutcome, verb: &str) -> i32 {
    match outcome {
        CancelOutcome::Cancelled(session) => {
            eprintln!(
                "{} {} session {}; the change stays.",
                prefix(),
                verb,
                session.id.bold()
            );
            0
        }
        CancelOutcome::AlreadyReverted(session) => {
            eprintln!(
                "{} Session {} was already reverted; the previous config is back.",
                prefix(),
                session.id.bold()
            );
            1
        }
    }
}

fn cmd_confirm(rt: &Runtime) -> Result<i32> {
    let outcome = rt.watchdog()?.confirm_reachability()?;
    Ok(report_cancel(outcome, "Confirmed"))
}

fn cmd_cancel(rt: &Runtime) -> Result<i32> {
    let outcome = rt.watchdog()?.cancel()?;
    Ok(report_cancel(outcome, "Cancelled the timer for"))
}

fn status_json(status: &ArmedStatus) -> serde_json::Value {
    serde_json::json!({
        "id": status.session.id,
        "label": status.session.label,
        "armed_at": status.session.armed_at.to_rfc3339(),
        "deadline": status.deadline.to_rfc3339(),
        "remaining_secs": status.remaining_secs,
        "worker_pid": status.session.worker_pid,
        "worker_alive": status.worker_alive,
        "stale": status.stale,
    })
}

fn cmd_status(rt: &Runtime, json: bool) -> Result<i32> {
    let status = rt.watchdog()?.status()?;

    if json {
        let value = status
            .as_ref()
            .map_or(serde_json::Value::Null, status_json);
        println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| "null".to_string())
        );
        return Ok(0);
    }

    let Some(status) = status else {
        eprintln!("{} Nothing armed.", prefix());
        return Ok(0);
    };

    eprintln!("{} Armed session {} ({})", prefix(), status.session.id.bold(), status.session.label);
    if status.remaining_secs > 0 {
        eprintln!("  reverts in {}s at {}", status.remaining_secs, status.deadline.to_rfc3339());
    } else {
        eprintln!("  deadline passed {}s ago", -status.remaining_secs);
    }
    match status.worker_alive {
        Some(true) => eprintln!("  revert worker running"),
        Some(false) => eprintln!("  revert worker {}", "gone".red()),
        None => eprintln!("  revert worker pid unknown"),
    }
    if status.stale {
        eprintln!(
            "{} {}",
            prefix(),
            "The marker is stale; `lifeline-rescue` can clear it.".red()
        );
        return Ok(1);
    }
    Ok(0)
}

/// Body of the detached revert worker.
pub fn run_watchdog_worker(session: &Path) -> Result<i32> {
    match run_worker(session)? {
        WorkerOutcome::Cancelled => info!("Session {} cancelled", session.display()),
        WorkerOutcome::RevertedElsewhere => {
            info!("Session {} was reverted by the arming process", session.display());
        }
        WorkerOutcome::Undetermined => {
            warn!("Session {} ended with an unreadable decision", session.display());
            return Ok(1);
        }
        WorkerOutcome::Reverted { errors } => {
            if errors.is_empty() {
                info!("Session {} reverted", session.display());
            } else {
                warn!(
                    "Session {} reverted with {} error(s)",
                    session.display(),
                    errors.len()
                );
                return Ok(1);
            }
        }
    }
    Ok(0)
}
