//! Error types for the lifeline library

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur in the lifeline library
#[derive(Error, Debug)]
pub enum LifelineError {
    // Fail-closed validation (no mutation has happened)
    #[error("Validation failed for {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    // Backup/restore errors
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    // Watchdog errors
    #[error("Control channel {address} not confirmed within {timeout_secs}s: {detail}")]
    ReachabilityTimeout {
        address: String,
        timeout_secs: u64,
        detail: String,
    },

    #[error("A watchdog session is already armed: {0}")]
    AlreadyArmed(String),

    #[error("No watchdog session is armed")]
    NotArmed,

    #[error("Revert timeout must be at least one second")]
    ZeroTimeout,

    // Transaction errors
    #[error("Transaction '{0}' is already open (transactions do not nest)")]
    AlreadyOpen(String),

    #[error("No transaction is open")]
    NoOpenTransaction,

    #[error("Unknown checkpoint: {0}")]
    UnknownCheckpoint(String),

    #[error("Transaction journal error: {0}")]
    Journal(String),

    // Orchestrator errors
    #[error("Task '{task}' has unmet dependencies: {}", .missing.join(", "))]
    DependencyUnmet { task: String, missing: Vec<String> },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid task definition '{task}': {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("Run interrupted by {0}")]
    Interrupted(String),

    // External command errors
    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to start `{command}`: {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    #[error("Aborted: {0}")]
    Aborted(String),
}

/// Result type alias for lifeline operations
pub type Result<T> = std::result::Result<T, LifelineError>;

/// Build a `map_err` adapter that attaches `path` to an I/O error.
pub fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LifelineError + '_ {
    move |source| LifelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}
