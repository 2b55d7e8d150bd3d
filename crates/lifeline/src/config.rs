//! Runtime configuration
//!
//! Configuration is a single TOML file. Every section is optional and falls
//! back to defaults suitable for a Debian-style host running OpenSSH and
//! iptables. Lookup order:
//!
//! 1. An explicit path (`--config`), which must exist
//! 2. `$LIFELINE_CONFIG`
//! 3. `/etc/lifeline/config.toml`
//!
//! A missing file in steps 2 and 3 yields the defaults. A file that exists but
//! does not parse is always an error.

use crate::error::{LifelineError, Result};
use crate::txn::ServiceState;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// System-wide config location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lifeline/config.toml";

/// Environment variable overriding the config location
pub const CONFIG_ENV_VAR: &str = "LIFELINE_CONFIG";

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub retention: RetentionConfig,
    pub orchestrator: OrchestratorConfig,
    pub channel: ChannelConfig,
    pub firewall: FirewallConfig,
    pub system: SystemConfig,
    pub snapshot: SnapshotConfig,
    pub emergency: EmergencyConfig,
    pub tasks: Vec<TaskConfig>,
}

impl Config {
    /// Resolve and load the configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(LifelineError::ConfigRead {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "config file not found",
                    ),
                });
            }
            return Self::load_from_file(path);
        }

        let path = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    /// Load configuration from a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| LifelineError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LifelineError::ConfigParse(e.to_string()))
    }

    /// Point every on-disk location below `root`. Used by tests and by
    /// operators staging a run against a scratch tree.
    #[must_use]
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.paths.backup_root = root.join("backups");
        self.paths.state_dir = root.join("state");
        self
    }
}

/// On-disk locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Backup store root (manifest, copies, snapshots)
    pub backup_root: PathBuf,
    /// Run state: journal, rollback log, markers, watchdog sessions
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/backups/lifeline"),
            state_dir: PathBuf::from("/var/lib/lifeline"),
        }
    }
}

impl PathsConfig {
    /// Directory holding task completion markers
    #[must_use]
    pub fn markers_dir(&self) -> PathBuf {
        self.state_dir.join("markers")
    }

    /// Directory holding the watchdog armed marker and sessions
    #[must_use]
    pub fn watchdog_dir(&self) -> PathBuf {
        self.state_dir.join("watchdog")
    }

    /// Transaction journal location
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("journal.jsonl")
    }

    /// Rollback log location
    #[must_use]
    pub fn rollback_log_path(&self) -> PathBuf {
        self.state_dir.join("rollback.log")
    }
}

/// Backup retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Backups older than this many days are removed by `prune`
    pub days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: 30 }
    }
}

/// Orchestrator behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Abort the remaining run after the first failed task
    pub fail_fast: bool,
}

/// Control channel (remote shell daemon) tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Production configuration file
    pub config_path: PathBuf,
    /// Syntax checker; `{config}` is the candidate path
    pub validate_command: Vec<String>,
    /// Foreground daemon for the parallel test instance
    pub test_instance_command: Vec<String>,
    /// Reloads the live daemon after a config swap
    pub reload_command: Vec<String>,
    /// Address the production daemon listens on
    pub production_address: SocketAddr,
    /// Alternate address for the parallel test instance
    pub alt_address: SocketAddr,
    /// Expected prefix of the server greeting line
    pub banner_prefix: String,
    /// Optional authenticated probe; must exit 0 for a confirmation
    pub probe_command: Option<Vec<String>>,
    /// Bound on each reachability probe
    pub probe_timeout_secs: u64,
    /// Default time before an unconfirmed change is reverted
    pub revert_timeout_secs: u64,
    /// Extra margin callers allow the revert worker after the deadline
    pub grace_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/ssh/sshd_config"),
            validate_command: argv(&["sshd", "-t", "-f", "{config}"]),
            test_instance_command: argv(&["/usr/sbin/sshd", "-D", "-e", "-f", "{config}"]),
            reload_command: argv(&["systemctl", "reload", "sshd"]),
            production_address: SocketAddr::from(([127, 0, 0, 1], 22)),
            alt_address: SocketAddr::from(([0, 0, 0, 0], 2222)),
            banner_prefix: "SSH-".to_string(),
            probe_command: None,
            probe_timeout_secs: 10,
            revert_timeout_secs: 300,
            grace_secs: 5,
        }
    }
}

/// Packet filter tooling used by firewall tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Dumps the current rule set to stdout
    pub save_command: Vec<String>,
    /// Re-applies a dump; `{dump}` is the dump path
    pub restore_command: Vec<String>,
    /// Revert timer for firewall changes
    pub guard_timeout_secs: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            save_command: argv(&["iptables-save"]),
            restore_command: argv(&["iptables-restore", "{dump}"]),
            guard_timeout_secs: 120,
        }
    }
}

/// Commands used to execute undo actions against the live system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// `{state}` is the verb (start, stop, ...), `{name}` the unit
    pub service_command: Vec<String>,
    pub sysctl_read_command: Vec<String>,
    pub sysctl_write_command: Vec<String>,
    /// Rule tool; an undo rule's argv is appended to it
    pub firewall_command: Vec<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            service_command: argv(&["systemctl", "{state}", "{name}"]),
            sysctl_read_command: argv(&["sysctl", "-n", "{key}"]),
            sysctl_write_command: argv(&["sysctl", "-w", "{key}={value}"]),
            firewall_command: argv(&["iptables"]),
        }
    }
}

/// One raw state dump taken by a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCapture {
    /// Dump name, also its file name inside the snapshot
    pub name: String,
    /// Command whose stdout is captured
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// File whose content is captured (e.g. `/proc/mounts`)
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Command re-applying the dump on restore; `{dump}` is the dump path
    #[serde(default)]
    pub restore: Option<Vec<String>>,
}

/// What a snapshot captures and how a snapshot restore finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub files: Vec<PathBuf>,
    pub states: Vec<StateCapture>,
    /// Run after files and dumps are restored
    pub reload_commands: Vec<Vec<String>>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        let capture = |name: &str, command: &[&str], restore: Option<&[&str]>| StateCapture {
            name: name.to_string(),
            command: Some(argv(command)),
            source: None,
            restore: restore.map(argv),
        };
        Self {
            files: [
                "/etc/ssh/sshd_config",
                "/etc/sysctl.conf",
                "/etc/fstab",
                "/etc/hosts.allow",
                "/etc/hosts.deny",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            states: vec![
                capture(
                    "iptables",
                    &["iptables-save"],
                    Some(&["iptables-restore", "{dump}"]),
                ),
                capture("sysctl", &["sysctl", "-a"], None),
                StateCapture {
                    name: "mounts".to_string(),
                    command: None,
                    source: Some(PathBuf::from("/proc/mounts")),
                    restore: None,
                },
                capture("processes", &["ps", "aux"], None),
                capture("listening", &["ss", "-tlnp"], None),
            ],
            reload_commands: vec![
                argv(&["sysctl", "--system"]),
                argv(&["systemctl", "reload", "sshd"]),
            ],
        }
    }
}

/// A file whose permissions the emergency controller resets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub path: PathBuf,
    pub mode: u32,
}

/// Emergency recovery defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Commands that open the packet filter completely
    pub permissive_firewall: Vec<Vec<String>>,
    pub critical_permissions: Vec<PermissionEntry>,
    /// Launches the emergency daemon; `{config}` is the rendered config
    pub emergency_start_command: Vec<String>,
    /// Where the emergency daemon config is written
    pub emergency_config_path: PathBuf,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        let perm = |path: &str, mode: u32| PermissionEntry {
            path: PathBuf::from(path),
            mode,
        };
        Self {
            permissive_firewall: vec![
                argv(&["iptables", "-P", "INPUT", "ACCEPT"]),
                argv(&["iptables", "-P", "FORWARD", "ACCEPT"]),
                argv(&["iptables", "-P", "OUTPUT", "ACCEPT"]),
                argv(&["iptables", "-F"]),
            ],
            critical_permissions: vec![
                perm("/etc/passwd", 0o644),
                perm("/etc/group", 0o644),
                perm("/etc/shadow", 0o640),
                perm("/etc/gshadow", 0o640),
                perm("/etc/sudoers", 0o440),
                perm("/etc/ssh/sshd_config", 0o600),
            ],
            emergency_start_command: argv(&["/usr/sbin/sshd", "-f", "{config}"]),
            emergency_config_path: PathBuf::from("/etc/ssh/sshd_config.emergency"),
        }
    }
}

/// A task declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub tier: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// The generic task kinds lifeline can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskKind {
    /// Arbitrary check/apply/undo commands
    Command {
        /// Exit 0 means the change is already in place
        #[serde(default)]
        check: Option<Vec<String>>,
        apply: Vec<String>,
        undo: Vec<String>,
    },
    /// Replace a file's content
    File {
        path: PathBuf,
        content: String,
        #[serde(default)]
        mode: Option<u32>,
    },
    /// Set a kernel parameter at runtime
    Sysctl { key: String, value: String },
    /// Change a service's state
    Service {
        /// Unit name (`name` is taken by the task itself)
        unit: String,
        state: ServiceState,
        undo_state: ServiceState,
    },
    /// Append packet filter rules under a revert timer
    Firewall { rules: Vec<Vec<String>> },
    /// Swap in a new control-channel config through the watchdog
    ControlChannel { candidate: PathBuf },
}

impl TaskKind {
    /// Short label for listings
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::File { .. } => "file",
            Self::Sysctl { .. } => "sysctl",
            Self::Service { .. } => "service",
            Self::Firewall { .. } => "firewall",
            Self::ControlChannel { .. } => "control-channel",
        }
    }
}
