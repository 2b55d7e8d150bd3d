//! lifeline - safe application of risky changes to a remotely administered host
//!
//! This library provides the safety core used by the `lifeline` CLI: a
//! backup/snapshot store, a transactional undo engine, a timed watchdog that
//! reverts control-channel changes unless they are confirmed, and a
//! dependency-ordered task orchestrator that drives all three.
//!
//! # Overview
//!
//! ```no_run
//! use lifeline::{BackupStore, Config, Engine, UndoAction};
//!
//! fn main() -> lifeline::Result<()> {
//!     let config = Config::default();
//!     let store = BackupStore::open(&config.paths.backup_root)?;
//!     let mut engine = Engine::new(store, config.system.clone(), &config.paths.state_dir)?;
//!
//!     engine.begin("tighten-sshd")?;
//!     engine.atomic_file_update("/etc/ssh/sshd_config".as_ref(), |work| {
//!         let text = std::fs::read_to_string(work).map_err(lifeline::error::io_err(work))?;
//!         let text = text.replace("PermitRootLogin yes", "PermitRootLogin no");
//!         std::fs::write(work, text).map_err(lifeline::error::io_err(work))
//!     })?;
//!     engine.commit()?;
//!     Ok(())
//! }
//! ```
//!
//! # Components
//!
//! - [`store`]: immutable file, directory and snapshot backups behind an
//!   append-only manifest
//! - [`txn`]: per-run undo stack with begin/commit/rollback/checkpoint
//! - [`watchdog`]: validate, test-deploy and arm control-channel changes with
//!   an independently running revert timer
//! - [`orchestrator`]: tiered task execution with dependencies and
//!   completion markers
//! - [`emergency`]: blunt last-resort recovery straight from the backup store

pub mod config;
pub mod emergency;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod orchestrator;
pub mod store;
pub mod txn;
pub mod watchdog;

// Re-exports for convenience
pub use config::Config;
pub use emergency::{EmergencyController, EmergencyStep};
pub use error::{LifelineError, Result};
pub use orchestrator::{
    task_fn, FailurePolicy, Orchestrator, RunSummary, TaskContext, TaskFn, TaskState, TaskStatus,
};
pub use store::{BackupKind, BackupRecord, BackupStore, Checksum, SnapshotInfo};
pub use txn::{Engine, RollbackReport, ServiceState, UndoAction};
pub use watchdog::{
    CancelOutcome, DetachedProcess, FlowOutcome, RevertPlan, RevertSpawner, Watchdog,
    WatchdogSession,
};
