//! Emergency recovery
//!
//! The last-resort path for when the orchestrator or the watchdog cannot
//! be trusted. Every operation reads straight from the backup store, writes
//! straight to the live system and can be repeated. Nothing here goes
//! through the transaction engine.
//!
//! The full sequence deliberately leaves the host open (permissive packet
//! filter, permissive recovery daemon). Callers must tell the operator.

use crate::config::{ChannelConfig, Config, EmergencyConfig, PathsConfig, SnapshotConfig};
use crate::error::{io_err, LifelineError, Result};
use crate::exec;
use crate::fsutil;
use crate::store::{BackupStore, SnapshotInfo, SnapshotRestoreReport};
use crate::watchdog::{probe_banner, render_permissive_config, wait_for_banner, ARMED_MARKER};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Printed after a full emergency reset
pub const UNSECURED_NOTICE: &str = "WARNING: the system is now unsecured. The packet filter is \
permissive and a recovery daemon with relaxed authentication may be running. Re-harden the \
host as soon as access is restored.";

/// The independent recovery operations, in full-sequence order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyStep {
    RestoreControlChannelConfig,
    ResetPacketFilter,
    RestoreLatestSnapshot,
    ResetCriticalPermissions,
    CreateEmergencyAccessChannel,
    ClearOrchestratorState,
}

impl EmergencyStep {
    pub const ALL: [EmergencyStep; 6] = [
        Self::RestoreControlChannelConfig,
        Self::ResetPacketFilter,
        Self::RestoreLatestSnapshot,
        Self::ResetCriticalPermissions,
        Self::CreateEmergencyAccessChannel,
        Self::ClearOrchestratorState,
    ];

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::RestoreControlChannelConfig => "Restore the latest control-channel config backup",
            Self::ResetPacketFilter => "Reset the packet filter to accept everything",
            Self::RestoreLatestSnapshot => "Restore the latest system snapshot",
            Self::ResetCriticalPermissions => "Reset permissions of critical files",
            Self::CreateEmergencyAccessChannel => "Start an emergency access daemon",
            Self::ClearOrchestratorState => "Clear task markers, watchdog marker and journal",
        }
    }
}

impl fmt::Display for EmergencyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Result of one step of the full sequence
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: EmergencyStep,
    pub ok: bool,
    pub detail: String,
}

/// Standalone recovery operations
pub struct EmergencyController {
    store: BackupStore,
    paths: PathsConfig,
    channel: ChannelConfig,
    emergency: EmergencyConfig,
    snapshot: SnapshotConfig,
}

impl EmergencyController {
    pub fn new(store: BackupStore, config: &Config) -> Self {
        Self {
            store,
            paths: config.paths.clone(),
            channel: config.channel.clone(),
            emergency: config.emergency.clone(),
            snapshot: config.snapshot.clone(),
        }
    }

    /// Open the configured backup store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = BackupStore::open(&config.paths.backup_root)?;
        Ok(Self::new(store, config))
    }

    /// Copy the newest backup of the control-channel config back and reload.
    pub fn restore_latest_control_channel_config(&self) -> Result<String> {
        let target = &self.channel.config_path;
        let record = self.store.latest_for(target)?.ok_or_else(|| {
            LifelineError::NotFound(format!("no backup of {}", target.display()))
        })?;
        self.store.restore_file(&record)?;
        exec::run(&self.channel.reload_command)?;
        info!("Restored {} from {}", target.display(), record.backup.display());
        Ok(format!(
            "restored {} from backup taken {}",
            target.display(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S")
        ))
    }

    /// Run every permissive packet filter command, even after a failure.
    pub fn reset_packet_filter_to_permissive(&self) -> Result<String> {
        let mut first_error = None;
        for argv in &self.emergency.permissive_firewall {
            if let Err(e) = exec::run(argv) {
                error!("{e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(format!(
                "ran {} packet filter commands",
                self.emergency.permissive_firewall.len()
            )),
        }
    }

    /// Replay the newest snapshot. `confirm` must approve it.
    pub fn restore_latest_snapshot<F>(&self, confirm: F) -> Result<SnapshotRestoreReport>
    where
        F: FnOnce(&SnapshotInfo) -> bool,
    {
        let info = self
            .store
            .latest_snapshot()?
            .ok_or_else(|| LifelineError::NotFound("no snapshot in the backup store".to_string()))?;
        self.store
            .restore_snapshot_info(&info, &self.snapshot.reload_commands, confirm)
    }

    /// Put the configured permission bits back. Missing files are skipped.
    pub fn reset_critical_file_permissions(&self) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();
        let mut first_error = None;
        for entry in &self.emergency.critical_permissions {
            if !entry.path.exists() {
                warn!("{} does not exist, skipping", entry.path.display());
                continue;
            }
            match fsutil::set_mode(&entry.path, entry.mode) {
                Ok(()) => changed.push(entry.path.clone()),
                Err(e) => {
                    error!("{e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    /// Start a daemon with permissive authentication on `alt` (default:
    /// the configured alternate address) and wait for it to answer.
    ///
    /// If something already answers there, nothing is started.
    pub fn create_emergency_access_channel(&self, alt: Option<SocketAddr>) -> Result<SocketAddr> {
        let alt = alt.unwrap_or(self.channel.alt_address);
        let prefix = &self.channel.banner_prefix;
        if probe_banner(alt, prefix, Duration::from_secs(1)).is_ok() {
            info!("A daemon already answers on {alt}");
            return Ok(alt);
        }

        let base = match fs::read_to_string(&self.channel.config_path) {
            Ok(base) => base,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "{} is missing, rendering from an empty base",
                    self.channel.config_path.display()
                );
                String::new()
            }
            Err(e) => return Err(io_err(&self.channel.config_path)(e)),
        };

        let config_path = &self.emergency.emergency_config_path;
        let pid_file = config_path.with_extension("pid");
        let rendered = render_permissive_config(&base, alt, &pid_file);
        fsutil::atomic_write_mode(config_path, rendered.as_bytes(), Some(0o600))?;

        let argv = exec::render_path(&self.emergency.emergency_start_command, "config", config_path);
        exec::run(&argv)?;
        let timeout = Duration::from_secs(self.channel.probe_timeout_secs.max(1));
        wait_for_banner(alt, prefix, timeout)?;
        warn!("Emergency access daemon listening on {alt}");
        Ok(alt)
    }

    /// Remove completion markers, the watchdog marker and the journal.
    /// Returns how many entries were removed.
    pub fn clear_orchestrator_state(&self) -> Result<usize> {
        let mut removed = 0;

        let markers = self.paths.markers_dir();
        match fs::read_dir(&markers) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(io_err(&markers))?;
                    if fsutil::remove_path(&entry.path())? {
                        removed += 1;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&markers)(e)),
        }

        for path in [
            self.paths.watchdog_dir().join(ARMED_MARKER),
            self.paths.journal_path(),
        ] {
            if fsutil::remove_path(&path)? {
                info!("Removed {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run one step, reporting instead of failing.
    pub fn run_step<F>(&self, step: EmergencyStep, confirm_snapshot: F) -> StepReport
    where
        F: FnOnce(&SnapshotInfo) -> bool,
    {
        let result = match step {
            EmergencyStep::RestoreControlChannelConfig => {
                self.restore_latest_control_channel_config()
            }
            EmergencyStep::ResetPacketFilter => self.reset_packet_filter_to_permissive(),
            EmergencyStep::RestoreLatestSnapshot => {
                self.restore_latest_snapshot(confirm_snapshot).and_then(|report| {
                    if report.is_clean() {
                        Ok(format!("restored {} files", report.restored.len()))
                    } else {
                        Err(LifelineError::Snapshot(format!(
                            "{} files and {} commands failed",
                            report.failed.len(),
                            report.commands_failed.len()
                        )))
                    }
                })
            }
            EmergencyStep::ResetCriticalPermissions => self
                .reset_critical_file_permissions()
                .map(|changed| format!("reset {} files", changed.len())),
            EmergencyStep::CreateEmergencyAccessChannel => self
                .create_emergency_access_channel(None)
                .map(|addr| format!("listening on {addr}")),
            EmergencyStep::ClearOrchestratorState => self
                .clear_orchestrator_state()
                .map(|n| format!("removed {n} entries")),
        };

        match result {
            Ok(detail) => StepReport {
                step,
                ok: true,
                detail,
            },
            Err(e) => {
                error!("{step} failed: {e}");
                StepReport {
                    step,
                    ok: false,
                    detail: e.to_string(),
                }
            }
        }
    }

    /// Run all six steps in order, continuing past failures.
    ///
    /// With `force` the snapshot restore is approved without asking.
    pub fn run_full_sequence<F>(&self, force: bool, mut confirm_snapshot: F) -> Vec<StepReport>
    where
        F: FnMut(&SnapshotInfo) -> bool,
    {
        let reports = EmergencyStep::ALL
            .iter()
            .map(|&step| self.run_step(step, |info| force || confirm_snapshot(info)))
            .collect();
        warn!("{UNSECURED_NOTICE}");
        reports
    }
}
