//! Backup and snapshot store
//!
//! Immutable point-in-time copies of files, directory trees and raw system
//! state, indexed by an append-only manifest. A copy only counts as a backup
//! once its manifest line exists.
//!
//! Layout under the store root:
//!
//! ```text
//! manifest
//! files/<flattened-source>.<stamp>
//! dirs/<flattened-source>.<stamp>/...
//! state/<name>.<stamp>
//! snapshots/<id>/{files/,state/,snapshot.json}
//! ```

mod backup;
pub mod manifest;
mod snapshot;
mod types;

pub use backup::{BackupStore, PruneReport, VerifyReport, STORE_DIR_MODE};
pub use manifest::Manifest;
pub use snapshot::SnapshotRestoreReport;
pub use types::{BackupKind, BackupRecord, Checksum, ChecksumParseError, SnapshotInfo, StateDump};

use crate::error::{LifelineError, Result};
use chrono::Utc;

/// Validate an identifier that becomes a directory name (snapshot or
/// watchdog session id) so it can never escape its parent directory.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(LifelineError::NotFound("empty identifier".to_string()));
    }
    if id.contains(std::path::MAIN_SEPARATOR)
        || id.contains('/')
        || id.contains("..")
        || id.contains('\0')
        || id.contains('|')
        || id.contains('\n')
        || id.starts_with('.')
    {
        return Err(LifelineError::NotFound(format!("invalid identifier: {id}")));
    }
    Ok(())
}

/// Generate an identifier of the form `YYYYMMDD-HHMMSS-<pid>`.
#[must_use]
pub fn generate_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        std::process::id()
    )
}

/// Parse the PID out of an id produced by [`generate_id`].
#[must_use]
pub fn pid_from_id(id: &str) -> Option<u32> {
    id.rsplit('-').next()?.parse().ok()
}
