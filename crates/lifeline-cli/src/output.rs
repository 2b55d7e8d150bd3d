//! Terminal output helpers shared by the subcommands

use colored::Colorize;
use lifeline::orchestrator::TaskStatus;
use lifeline::{RollbackReport, RunSummary};
use std::io::{BufRead, IsTerminal, Write};

pub fn prefix() -> colored::ColoredString {
    "[lifeline]".truecolor(204, 102, 0)
}

pub fn print_banner(silent: bool, dry_run: bool) {
    if silent {
        return;
    }
    let mode = if dry_run { " (dry run)" } else { "" };
    eprintln!(
        "{} v{}{}",
        "lifeline".truecolor(204, 102, 0).bold(),
        env!("CARGO_PKG_VERSION"),
        mode.yellow()
    );
}

/// Ask a yes/no question on stderr.
///
/// `assume_yes` short-circuits to true. Without a terminal on stdin the
/// answer is no.
pub fn confirm(question: &str, assume_yes: bool) -> bool {
    if assume_yes {
        return true;
    }
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        eprintln!("{} {} (no terminal, assuming no)", prefix(), question);
        return false;
    }

    eprint!("{} {} [y/N]: ", prefix(), question);
    let _ = std::io::stderr().flush();

    let mut input = String::new();
    if stdin.lock().read_line(&mut input).is_err() {
        return false;
    }
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

pub fn print_run_summary(summary: &RunSummary, silent: bool) {
    if silent {
        return;
    }
    for name in &summary.completed {
        eprintln!("  {} {}", "done".green(), name);
    }
    for name in &summary.already_completed {
        eprintln!("  {} {}", "skip".truecolor(150, 150, 150), name);
    }
    for name in &summary.dry_run {
        eprintln!("  {} {}", "plan".cyan(), name);
    }
    for (name, missing) in &summary.skipped {
        eprintln!(
            "  {} {} (waiting on {})",
            "wait".yellow(),
            name,
            missing.join(", ")
        );
    }
    for (name, error) in &summary.failed {
        eprintln!("  {} {}: {}", "FAIL".red().bold(), name, error);
    }

    eprintln!();
    let line = format!(
        "{} completed, {} already done, {} skipped, {} failed",
        summary.completed.len(),
        summary.already_completed.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    if summary.is_success() {
        eprintln!("{} {}", prefix(), line);
    } else {
        eprintln!("{} {}", prefix(), line.red());
    }
    if summary.aborted {
        eprintln!("{} Stopped after the first failure (fail-fast).", prefix());
    }
}

pub fn print_task_table(tasks: &[TaskStatus]) {
    if tasks.is_empty() {
        eprintln!("{} No tasks configured.", prefix());
        return;
    }
    let width = tasks.iter().map(|t| t.name.len()).max().unwrap_or(4).max(4);
    println!("{:<4}  {:<width$}  {:<18}  DEPENDS ON", "TIER", "TASK", "STATE");
    for task in tasks {
        let deps = if task.depends_on.is_empty() {
            "-".to_string()
        } else {
            task.depends_on.join(", ")
        };
        println!(
            "{:<4}  {:<width$}  {:<18}  {}",
            task.tier,
            task.name,
            task.state.label(),
            deps.truecolor(150, 150, 150)
        );
    }
}

pub fn print_rollback_report(report: &RollbackReport) {
    for outcome in &report.outcomes {
        match &outcome.error {
            None => eprintln!("  {} {}", "undone".green(), outcome.action),
            Some(e) => eprintln!("  {} {}: {}", "FAILED".red().bold(), outcome.action, e),
        }
    }
    if report.is_clean() {
        eprintln!("{} Rolled back {} action(s).", prefix(), report.outcomes.len());
    } else {
        eprintln!(
            "{} {} of {} undo action(s) failed; inspect the rollback log.",
            prefix(),
            report.failures(),
            report.outcomes.len()
        );
    }
}
