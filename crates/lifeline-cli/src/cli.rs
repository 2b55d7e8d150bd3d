//! CLI argument definitions for lifeline
//!
//! Every subcommand shares the global flags defined on [`Cli`] so that
//! `--dry-run` or `--config` can be given anywhere on the command line.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// lifeline - harden a remote host without locking yourself out
///
/// Applies configured hardening tasks in dependency order. Every change is
/// backed up and undoable, and control-channel changes are reverted
/// automatically unless confirmed from a fresh session.
#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: $LIFELINE_CONFIG or /etc/lifeline/config.toml)
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Silent mode - suppress banner and summaries
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    /// Log what would be done without changing anything
    #[arg(long, short = 'n', global = true)]
    pub dry_run: bool,

    /// Re-run tasks that already have a completion marker
    #[arg(long, short = 'f', global = true)]
    pub force: bool,

    /// Answer yes to confirmation prompts
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every configured task, tier by tier
    #[command(after_help = "EXAMPLES:
    # Apply everything
    lifeline run-all

    # See what would happen
    lifeline --dry-run run-all

    # Take a snapshot first and stop at the first failure
    lifeline run-all --snapshot --fail-fast
")]
    RunAll(RunArgs),

    /// Run a single task
    #[command(after_help = "EXAMPLES:
    # Run one task (its dependencies must already be complete)
    lifeline run-one sshd-hardening

    # Re-run a task that already completed
    lifeline run-one sshd-hardening --force
")]
    RunOne {
        /// Task name
        task: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run the tasks of one tier
    RunTier {
        /// Tier number
        tier: u32,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show task completion state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Roll back a run that was interrupted before it committed
    Recover,

    /// Manage backups and snapshots
    Backup(BackupArgs),

    /// Control-channel watchdog
    Watchdog(WatchdogArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Stop at the first failed task
    #[arg(long, conflicts_with = "keep_going")]
    pub fail_fast: bool,

    /// Keep running after a task fails
    #[arg(long)]
    pub keep_going: bool,

    /// Take a full snapshot before running
    #[arg(long)]
    pub snapshot: bool,
}

impl RunArgs {
    /// Explicit policy flag, if one was given
    pub fn fail_fast_override(&self) -> Option<bool> {
        if self.fail_fast {
            Some(true)
        } else if self.keep_going {
            Some(false)
        } else {
            None
        }
    }
}

#[derive(Parser, Debug)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupCommands,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// Back up one file
    File {
        path: PathBuf,
    },

    /// Back up a directory tree
    Dir {
        path: PathBuf,
    },

    /// Capture the configured files and system state as one snapshot
    #[command(after_help = "EXAMPLES:
    # Snapshot with a generated id
    lifeline backup snapshot

    # Snapshot with a chosen id
    lifeline backup snapshot --id before-upgrade
")]
    Snapshot {
        /// Snapshot id ([A-Za-z0-9._-])
        #[arg(long)]
        id: Option<String>,
    },

    /// List backup records
    List {
        /// Show snapshots instead of individual records
        #[arg(long)]
        snapshots: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Restore the most recent backup of a path
    Restore {
        path: PathBuf,
    },

    /// Restore a snapshot (latest if no id is given)
    #[command(after_help = "EXAMPLES:
    # Restore the newest snapshot after confirming
    lifeline backup restore-snapshot

    # Restore a specific snapshot without prompting
    lifeline backup restore-snapshot before-upgrade --yes
")]
    RestoreSnapshot {
        id: Option<String>,
    },

    /// Delete backups older than the retention period
    Prune {
        /// Retention in days (default: from config)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Re-hash stored copies against the manifest
    Verify {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Parser, Debug)]
pub struct WatchdogArgs {
    #[command(subcommand)]
    pub command: WatchdogCommands,
}

#[derive(Subcommand, Debug)]
pub enum WatchdogCommands {
    /// Check a candidate config with the daemon's own validator
    Validate {
        candidate: PathBuf,
    },

    /// Run the candidate on the alternate address and probe it
    Test {
        candidate: PathBuf,
    },

    /// Validate, test and swap in a candidate under a revert timer
    #[command(after_help = "EXAMPLES:
    # Arm with the configured timeout
    lifeline watchdog arm /root/sshd_config.new

    # Then, from a NEW session:
    lifeline watchdog confirm
")]
    Arm {
        candidate: PathBuf,

        /// Seconds until the automatic revert (default: from config)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },

    /// Probe the production channel and keep the change if it answers
    Confirm,

    /// Keep the armed change without probing
    Cancel,

    /// Show the armed session, if any
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Wait out an armed session and revert it (started by `arm`)
    #[command(hide = true)]
    RevertWorker {
        #[arg(long)]
        session: PathBuf,
    },
}
