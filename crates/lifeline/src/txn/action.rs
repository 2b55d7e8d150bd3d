//! Typed undo actions
//!
//! An undo action is the inverse of one mutation. Actions are serialised
//! into the transaction journal, so the tag names are part of the on-disk
//! format. A journal written by a newer build may contain tags this build
//! does not know; those deserialise to [`UndoAction::Unknown`] and are
//! skipped during rollback.

use crate::config::SystemConfig;
use crate::error::Result;
use crate::exec;
use crate::store::{BackupKind, BackupRecord, BackupStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

/// Target state of a service undo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Started,
    Stopped,
    Restarted,
    Reloaded,
    Enabled,
    Disabled,
}

impl ServiceState {
    /// The service manager verb reaching this state
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Started => "start",
            Self::Stopped => "stop",
            Self::Restarted => "restart",
            Self::Reloaded => "reload",
            Self::Enabled => "enable",
            Self::Disabled => "disable",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// The inverse of one mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum UndoAction {
    /// Copy a backup over `target`
    RestoreFile {
        backup: BackupRecord,
        target: PathBuf,
    },
    /// Run an arbitrary inverse command
    RunInverseCommand { command: Vec<String> },
    /// Bring a service back to a state
    SetServiceState { name: String, state: ServiceState },
    /// Apply a packet filter rule (argv appended to the filter tool)
    RestoreFirewallRule { rule: Vec<String> },
    /// Put a kernel parameter back
    RestoreSysctl { key: String, value: String },
    /// A tag written by a newer build
    #[serde(other)]
    Unknown,
}

/// What an undo action needs to touch the live system
pub struct UndoContext<'a> {
    pub store: &'a BackupStore,
    pub system: &'a SystemConfig,
    /// Log what would be undone without doing it
    pub dry_run: bool,
}

impl UndoAction {
    /// One-line description for logs and reports
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::RestoreFile { backup, target } => format!(
                "restore {} from {}",
                target.display(),
                backup.backup.display()
            ),
            Self::RunInverseCommand { command } => format!("run `{}`", exec::argv_display(command)),
            Self::SetServiceState { name, state } => format!("{} service {name}", state.verb()),
            Self::RestoreFirewallRule { rule } => format!("firewall rule `{}`", rule.join(" ")),
            Self::RestoreSysctl { key, value } => format!("sysctl {key}={value}"),
            Self::Unknown => "unknown action".to_string(),
        }
    }

    /// The argv this action would execute, if it runs a command.
    #[must_use]
    pub fn command(&self, system: &SystemConfig) -> Option<Vec<String>> {
        match self {
            Self::RunInverseCommand { command } => Some(command.clone()),
            Self::SetServiceState { name, state } => Some(exec::render(
                &system.service_command,
                &[("state", state.verb()), ("name", name)],
            )),
            Self::RestoreFirewallRule { rule } => {
                let mut argv = system.firewall_command.clone();
                argv.extend(rule.iter().cloned());
                Some(argv)
            }
            Self::RestoreSysctl { key, value } => Some(exec::render(
                &system.sysctl_write_command,
                &[("key", key), ("value", value)],
            )),
            Self::RestoreFile { .. } | Self::Unknown => None,
        }
    }

    /// Execute the action against the live system.
    pub fn undo(&self, ctx: &UndoContext<'_>) -> Result<()> {
        if ctx.dry_run {
            info!("[dry-run] would undo: {}", self.describe());
            return Ok(());
        }

        match self {
            Self::RestoreFile { backup, target } => {
                if backup.kind == BackupKind::Directory {
                    ctx.store.restore_directory(backup).map(|_| ())
                } else {
                    ctx.store.restore_file_to(backup, target)
                }
            }
            Self::Unknown => {
                warn!("Skipping undo action with an unknown tag");
                Ok(())
            }
            other => match other.command(ctx.system) {
                Some(argv) => exec::run(&argv).map(|_| ()),
                None => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unknown_tag_deserialises_to_unknown() {
        let json = r#"{"action":"restore-selinux-context","path":"/etc/shadow"}"#;
        let action: UndoAction = serde_json::from_str(json).expect("deserialize");
        assert_eq!(action, UndoAction::Unknown);
    }

    #[test]
    fn tags_are_kebab_case() {
        let action = UndoAction::RestoreSysctl {
            key: "kernel.kptr_restrict".to_string(),
            value: "1".to_string(),
        };
        let json = serde_json::to_string(&action).expect("serialize");
        assert!(json.contains(r#""action":"restore-sysctl""#));
    }

    #[test]
    fn commands_render_from_system_config() {
        let system = SystemConfig::default();
        let service = UndoAction::SetServiceState {
            name: "telnet.socket".to_string(),
            state: ServiceState::Started,
        };
        assert_eq!(
            service.command(&system),
            Some(vec![
                "systemctl".to_string(),
                "start".to_string(),
                "telnet.socket".to_string()
            ])
        );

        let rule = UndoAction::RestoreFirewallRule {
            rule: vec!["-D".to_string(), "INPUT".to_string()],
        };
        assert_eq!(
            rule.command(&system),
            Some(vec!["iptables".to_string(), "-D".to_string(), "INPUT".to_string()])
        );

        let sysctl = UndoAction::RestoreSysctl {
            key: "net.ipv4.ip_forward".to_string(),
            value: "1".to_string(),
        };
        assert_eq!(
            sysctl.command(&system).map(|a| a[2].clone()),
            Some("net.ipv4.ip_forward=1".to_string())
        );
    }

    #[test]
    fn dry_run_executes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let system = SystemConfig::default();
        let marker = dir.path().join("ran");
        let action = UndoAction::RunInverseCommand {
            command: vec!["touch".to_string(), marker.display().to_string()],
        };

        let ctx = UndoContext {
            store: &store,
            system: &system,
            dry_run: true,
        };
        action.undo(&ctx).expect("dry run");
        assert!(!marker.exists());

        let ctx = UndoContext { dry_run: false, ..ctx };
        action.undo(&ctx).expect("real run");
        assert!(marker.exists());
    }
}
