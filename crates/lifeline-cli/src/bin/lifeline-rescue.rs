//! lifeline-rescue - emergency recovery console
//!
//! Runs without the orchestrator or the watchdog. Every step reads straight
//! from the backup store and can be repeated.

use clap::Parser;
use colored::Colorize;
use lifeline::emergency::{EmergencyStep, StepReport, UNSECURED_NOTICE};
use lifeline::{Config, EmergencyController, Result, SnapshotInfo};
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// lifeline-rescue - get back into a host that lifeline locked down
///
/// Without options an interactive menu offers each recovery step on its own
/// and the full sequence.
#[derive(Parser, Debug)]
#[command(name = "lifeline-rescue")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Interactive menu
    lifeline-rescue

    # Everything, no questions asked (leaves the host unsecured)
    lifeline-rescue --force
")]
struct RescueCli {
    /// Configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run the full sequence without prompting
    #[arg(long, short = 'f')]
    force: bool,

    /// Answer yes to confirmation prompts
    #[arg(long, short = 'y')]
    yes: bool,
}

fn prefix() -> colored::ColoredString {
    "[lifeline-rescue]".truecolor(204, 102, 0)
}

fn main() {
    let cli = RescueCli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("lifeline-rescue: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: &RescueCli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?;
    let controller = EmergencyController::from_config(&config)?;

    if cli.force {
        return Ok(full_sequence(&controller, true, cli.yes));
    }

    if !std::io::stdin().is_terminal() {
        eprintln!(
            "{} No terminal; use --force to run the full sequence unattended.",
            prefix()
        );
        return Ok(2);
    }

    let mut last = 0;
    loop {
        print_menu();
        let Some(choice) = read_line("Select") else {
            return Ok(last);
        };
        match choice.as_str() {
            "q" | "quit" | "" => return Ok(last),
            "a" | "all" => {
                if ask("Run every step? This leaves the host unsecured.", cli.yes) {
                    last = full_sequence(&controller, false, cli.yes);
                }
            }
            other => match other.parse::<usize>().ok().and_then(step_at) {
                Some(step) => {
                    let yes = cli.yes;
                    let report = controller.run_step(step, |info| confirm_snapshot(info, yes));
                    print_report(&report);
                    last = i32::from(!report.ok);
                }
                None => eprintln!("{} Unknown choice '{}'", prefix(), other),
            },
        }
    }
}

fn step_at(number: usize) -> Option<EmergencyStep> {
    number
        .checked_sub(1)
        .and_then(|i| EmergencyStep::ALL.get(i))
        .copied()
}

fn print_menu() {
    eprintln!();
    for (i, step) in EmergencyStep::ALL.iter().enumerate() {
        eprintln!("  {}  {}", (i + 1).to_string().bold(), step);
    }
    eprintln!("  {}  Full sequence", "a".bold());
    eprintln!("  {}  Quit", "q".bold());
}

fn full_sequence(controller: &EmergencyController, force: bool, yes: bool) -> i32 {
    let reports = controller.run_full_sequence(force, |info| confirm_snapshot(info, yes));
    for report in &reports {
        print_report(report);
    }
    eprintln!();
    eprintln!("{}", UNSECURED_NOTICE.red().bold());
    if reports.iter().all(|r| r.ok) {
        0
    } else {
        1
    }
}

fn print_report(report: &StepReport) {
    let status = if report.ok {
        "ok".green()
    } else {
        "FAILED".red().bold()
    };
    eprintln!("{} {} [{}] {}", prefix(), report.step, status, report.detail);
}

fn confirm_snapshot(info: &SnapshotInfo, yes: bool) -> bool {
    ask(
        &format!(
            "Restore snapshot {} from {} ({} files)?",
            info.id,
            info.created.format("%Y-%m-%d %H:%M:%S"),
            info.files.len()
        ),
        yes,
    )
}

fn read_line(label: &str) -> Option<String> {
    eprint!("{} {}: ", prefix(), label);
    let _ = std::io::stderr().flush();
    let mut input = String::new();
    match std::io::stdin().lock().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_lowercase()),
    }
}

fn ask(question: &str, yes: bool) -> bool {
    if yes {
        return true;
    }
    if !std::io::stdin().is_terminal() {
        return false;
    }
    matches!(
        read_line(&format!("{question} [y/N]")).as_deref(),
        Some("y" | "yes")
    )
}
