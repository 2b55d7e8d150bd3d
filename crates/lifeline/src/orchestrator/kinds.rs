//! Task bodies for the task kinds declared in configuration

use super::{task_fn, Orchestrator, TaskContext, TaskFn};
use crate::config::{FirewallConfig, TaskConfig, TaskKind};
use crate::error::{LifelineError, Result};
use crate::exec;
use crate::fsutil;
use crate::txn::UndoAction;
use crate::watchdog::{CancelOutcome, RevertPlan, Watchdog};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Register every `[[tasks]]` entry.
pub fn register_configured(
    orch: &mut Orchestrator,
    tasks: &[TaskConfig],
    firewall: &FirewallConfig,
) -> Result<()> {
    for task in tasks {
        let deps: Vec<&str> = task.depends_on.iter().map(String::as_str).collect();
        orch.register_task(&task.name, task.tier, &deps, build(&task.kind, firewall))?;
    }
    Ok(())
}

pub(crate) fn build(kind: &TaskKind, firewall: &FirewallConfig) -> TaskFn {
    match kind.clone() {
        TaskKind::Command { check, apply, undo } => task_fn(move |ctx| {
            run_command(ctx, check.as_deref(), &apply, &undo)
        }),
        TaskKind::File {
            path,
            content,
            mode,
        } => task_fn(move |ctx| write_file(ctx, &path, &content, mode)),
        TaskKind::Sysctl { key, value } => task_fn(move |ctx| set_sysctl(ctx, &key, &value)),
        TaskKind::Service {
            unit,
            state,
            undo_state,
        } => task_fn(move |ctx| {
            let system = ctx.engine.system().clone();
            let apply = exec::render(
                &system.service_command,
                &[("state", state.verb()), ("name", unit.as_str())],
            );
            ctx.engine.register_and_mutate(
                UndoAction::SetServiceState {
                    name: unit.clone(),
                    state: undo_state,
                },
                || exec::run(&apply).map(|_| ()),
            )
        }),
        TaskKind::Firewall { rules } => {
            let firewall = firewall.clone();
            task_fn(move |ctx| apply_firewall(ctx, &firewall, &rules))
        }
        TaskKind::ControlChannel { candidate } => task_fn(move |ctx| {
            let watchdog = require_watchdog(ctx)?;
            let timeout = watchdog.channel().revert_timeout_secs;
            watchdog
                .run_flow(ctx.engine, &candidate, timeout)
                .map(|_| ())
        }),
    }
}

fn require_watchdog<'a>(ctx: &TaskContext<'a>) -> Result<&'a Watchdog> {
    ctx.watchdog.ok_or_else(|| LifelineError::InvalidTask {
        task: ctx.task.to_string(),
        reason: "this task kind needs the control-channel watchdog".to_string(),
    })
}

fn run_command(
    ctx: &mut TaskContext<'_>,
    check: Option<&[String]>,
    apply: &[String],
    undo: &[String],
) -> Result<()> {
    if let Some(check) = check {
        if exec::succeeds(check) {
            info!("{}: already applied", ctx.task);
            return Ok(());
        }
    }
    ctx.engine.register_and_mutate(
        UndoAction::RunInverseCommand {
            command: undo.to_vec(),
        },
        || exec::run(apply).map(|_| ()),
    )
}

fn write_file(
    ctx: &mut TaskContext<'_>,
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<()> {
    if path.exists() {
        let current = fs::read(path).map_err(crate::error::io_err(path))?;
        let mode_ok = mode.map_or(true, |m| fsutil::file_mode(path).ok() == Some(m));
        if current == content.as_bytes() && mode_ok {
            info!("{}: {} already up to date", ctx.task, path.display());
            return Ok(());
        }
        ctx.engine.atomic_file_update(path, |work| {
            let mode = mode.or_else(|| fsutil::file_mode(work).ok());
            fsutil::atomic_write_mode(work, content.as_bytes(), mode)
        })?;
        return Ok(());
    }

    // New file: undo removes it
    let target = path.to_path_buf();
    ctx.engine.register_and_mutate(
        UndoAction::RunInverseCommand {
            command: vec![
                "rm".to_string(),
                "-f".to_string(),
                target.to_string_lossy().into_owned(),
            ],
        },
        || fsutil::atomic_write_mode(&target, content.as_bytes(), mode.or(Some(0o644))),
    )
}

fn set_sysctl(ctx: &mut TaskContext<'_>, key: &str, value: &str) -> Result<()> {
    let system = ctx.engine.system().clone();
    let read = exec::render(&system.sysctl_read_command, &[("key", key)]);
    let old = String::from_utf8_lossy(&exec::capture(&read)?)
        .trim()
        .to_string();
    if old == value {
        info!("{}: {key} already {value}", ctx.task);
        return Ok(());
    }
    let write = exec::render(&system.sysctl_write_command, &[("key", key), ("value", value)]);
    ctx.engine.register_and_mutate(
        UndoAction::RestoreSysctl {
            key: key.to_string(),
            value: old,
        },
        || exec::run(&write).map(|_| ()),
    )
}

/// Inverse of a rule-adding argv: `-A`/`-I` become `-D`, and an insert
/// position is dropped.
pub fn inverse_rule(rule: &[String]) -> Result<Vec<String>> {
    let idx = rule
        .iter()
        .position(|a| matches!(a.as_str(), "-A" | "--append" | "-I" | "--insert"))
        .ok_or_else(|| LifelineError::InvalidTask {
            task: exec::argv_display(rule),
            reason: "firewall rule must append (-A) or insert (-I)".to_string(),
        })?;

    let mut inverse = rule.to_vec();
    let inserting = matches!(rule[idx].as_str(), "-I" | "--insert");
    inverse[idx] = "-D".to_string();
    if inserting
        && inverse
            .get(idx + 2)
            .is_some_and(|pos| pos.parse::<u32>().is_ok())
    {
        inverse.remove(idx + 2);
    }
    Ok(inverse)
}

fn apply_firewall(
    ctx: &mut TaskContext<'_>,
    firewall: &FirewallConfig,
    rules: &[Vec<String>],
) -> Result<()> {
    let system = ctx.engine.system().clone();
    let inverses = rules
        .iter()
        .map(|rule| inverse_rule(rule))
        .collect::<Result<Vec<_>>>()?;

    let apply_rules = |ctx: &mut TaskContext<'_>| -> Result<()> {
        for (rule, inverse) in rules.iter().zip(inverses.iter()) {
            let mut argv = system.firewall_command.clone();
            argv.extend(rule.iter().cloned());
            ctx.engine.register_and_mutate(
                UndoAction::RestoreFirewallRule {
                    rule: inverse.clone(),
                },
                || exec::run(&argv).map(|_| ()),
            )?;
        }
        Ok(())
    };

    if ctx.dry_run {
        return apply_rules(ctx);
    }

    let watchdog = require_watchdog(ctx)?;
    let dump = exec::capture(&firewall.save_command)?;
    let saved = ctx.engine.store().capture_state("firewall", &dump)?;
    let restore: PathBuf = saved.backup.clone();
    let plan = RevertPlan {
        restore: Vec::new(),
        commands: vec![exec::render_path(&firewall.restore_command, "dump", &restore)],
    };
    let guard = watchdog.arm_guard(
        &format!("firewall rules of {}", ctx.task),
        plan,
        firewall.guard_timeout_secs,
    )?;

    // The transaction unwinds the rules on failure; the guard restores the
    // dump now and is settled with it.
    let confirmed = apply_rules(ctx).and_then(|()| watchdog.confirm_session(&guard));
    let outcome = match confirmed {
        Ok(outcome) => outcome,
        Err(e) => {
            watchdog.abort_session(&guard, &format!("firewall task {} failed: {e}", ctx.task));
            return Err(e);
        }
    };
    match outcome {
        CancelOutcome::Cancelled(_) => Ok(()),
        CancelOutcome::AlreadyReverted(session) => Err(LifelineError::ReachabilityTimeout {
            address: watchdog.channel().production_address.to_string(),
            timeout_secs: session.timeout_secs,
            detail: "packet filter guard fired before confirmation".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, SystemConfig};
    use crate::store::BackupStore;
    use crate::txn::{Engine, ServiceState};
    use crate::watchdog::{banner_server, ThreadSpawner};
    use tempfile::TempDir;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn engine(dir: &Path, system: SystemConfig) -> Engine {
        let store = BackupStore::open(&dir.join("backups")).expect("store");
        Engine::new(store, system, &dir.join("state")).expect("engine")
    }

    fn run_in(engine: &mut Engine, watchdog: Option<&Watchdog>, task: &TaskFn) -> Result<()> {
        let dry_run = engine.dry_run();
        let mut ctx = TaskContext {
            task: "t",
            engine,
            watchdog,
            dry_run,
        };
        task(&mut ctx)
    }

    fn sh(script: &str, args: &[&str]) -> Vec<String> {
        let mut v = argv(&["sh", "-c", script]);
        v.extend(args.iter().map(|s| (*s).to_string()));
        v
    }

    #[test]
    fn inverse_rules() {
        assert_eq!(
            inverse_rule(&argv(&["-A", "INPUT", "-p", "tcp", "-j", "DROP"])).expect("inverse"),
            argv(&["-D", "INPUT", "-p", "tcp", "-j", "DROP"])
        );
        assert_eq!(
            inverse_rule(&argv(&["-I", "INPUT", "1", "-j", "ACCEPT"])).expect("inverse"),
            argv(&["-D", "INPUT", "-j", "ACCEPT"])
        );
        assert_eq!(
            inverse_rule(&argv(&["-t", "nat", "-I", "PREROUTING", "-j", "X"])).expect("inverse"),
            argv(&["-t", "nat", "-D", "PREROUTING", "-j", "X"])
        );
        assert!(inverse_rule(&argv(&["-F"])).is_err());
    }

    #[test]
    fn command_task_honours_check_and_undo() {
        let dir = TempDir::new().expect("tempdir");
        let flag = dir.path().join("flag");
        let flag_s = flag.to_string_lossy().into_owned();
        let kind = TaskKind::Command {
            check: Some(sh("test -e \"$0\"", &[&flag_s])),
            apply: argv(&["touch", &flag_s]),
            undo: argv(&["rm", "-f", &flag_s]),
        };
        let task = build(&kind, &FirewallConfig::default());
        let mut engine = engine(dir.path(), SystemConfig::default());

        engine.begin("t").expect("begin");
        run_in(&mut engine, None, &task).expect("run");
        assert!(flag.exists());
        assert!(engine.rollback("test").is_clean());
        assert!(!flag.exists());

        // Check passes: nothing registered, nothing run
        fs::write(&flag, "").expect("write");
        engine.begin("t").expect("begin");
        run_in(&mut engine, None, &task).expect("run");
        assert!(engine.current().expect("open").actions().is_empty());
        engine.commit().expect("commit");
    }

    #[test]
    fn file_task_replaces_and_creates() {
        let dir = TempDir::new().expect("tempdir");
        let existing = dir.path().join("existing");
        let fresh = dir.path().join("fresh");
        fs::write(&existing, "old").expect("write");
        let mut engine = engine(dir.path(), SystemConfig::default());

        let replace = build(
            &TaskKind::File {
                path: existing.clone(),
                content: "new".to_string(),
                mode: Some(0o600),
            },
            &FirewallConfig::default(),
        );
        let create = build(
            &TaskKind::File {
                path: fresh.clone(),
                content: "hello".to_string(),
                mode: None,
            },
            &FirewallConfig::default(),
        );

        engine.begin("t").expect("begin");
        run_in(&mut engine, None, &replace).expect("replace");
        run_in(&mut engine, None, &create).expect("create");
        assert_eq!(fs::read_to_string(&existing).expect("read"), "new");
        assert_eq!(fsutil::file_mode(&existing).expect("mode"), 0o600);
        assert_eq!(fs::read_to_string(&fresh).expect("read"), "hello");

        assert!(engine.rollback("test").is_clean());
        assert_eq!(fs::read_to_string(&existing).expect("read"), "old");
        assert!(!fresh.exists());
    }

    #[test]
    fn sysctl_task_restores_previous_value() {
        let dir = TempDir::new().expect("tempdir");
        let key = dir.path().join("net.ipv4.ip_forward");
        fs::write(&key, "1\n").expect("write");
        let system = SystemConfig {
            sysctl_read_command: sh("cat \"$0\"", &["{key}"]),
            sysctl_write_command: sh("printf '%s\\n' \"$1\" > \"$0\"", &["{key}", "{value}"]),
            ..SystemConfig::default()
        };
        let mut engine = engine(dir.path(), system);
        let task = build(
            &TaskKind::Sysctl {
                key: key.to_string_lossy().into_owned(),
                value: "0".to_string(),
            },
            &FirewallConfig::default(),
        );

        engine.begin("t").expect("begin");
        run_in(&mut engine, None, &task).expect("run");
        assert_eq!(fs::read_to_string(&key).expect("read"), "0\n");
        assert!(engine.rollback("test").is_clean());
        assert_eq!(fs::read_to_string(&key).expect("read"), "1\n");
    }

    #[test]
    fn service_task_registers_undo_state() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("service.log");
        let log_s = log.to_string_lossy().into_owned();
        let system = SystemConfig {
            service_command: sh("echo \"$1 $2\" >> \"$0\"", &[&log_s, "{state}", "{name}"]),
            ..SystemConfig::default()
        };
        let mut engine = engine(dir.path(), system);
        let task = build(
            &TaskKind::Service {
                unit: "telnet".to_string(),
                state: ServiceState::Stopped,
                undo_state: ServiceState::Started,
            },
            &FirewallConfig::default(),
        );

        engine.begin("t").expect("begin");
        run_in(&mut engine, None, &task).expect("run");
        assert!(engine.rollback("test").is_clean());
        assert_eq!(
            fs::read_to_string(&log).expect("read"),
            "stop telnet\nstart telnet\n"
        );
    }

    #[test]
    fn firewall_task_is_guarded_and_reversible() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("fw.log");
        let log_s = log.to_string_lossy().into_owned();
        let system = SystemConfig {
            firewall_command: sh("echo \"$*\" >> \"$0\"", &[&log_s]),
            ..SystemConfig::default()
        };
        let firewall = FirewallConfig {
            save_command: argv(&["echo", "*filter"]),
            restore_command: argv(&["true"]),
            guard_timeout_secs: 30,
        };
        let channel = ChannelConfig {
            production_address: banner_server("SSH-2.0-production\r\n"),
            probe_timeout_secs: 1,
            ..ChannelConfig::default()
        };
        let state = dir.path().join("state");
        let watchdog =
            Watchdog::new(channel, &state, Box::new(ThreadSpawner)).expect("watchdog");
        let mut engine = engine(dir.path(), system);
        let task = build(
            &TaskKind::Firewall {
                rules: vec![argv(&["-A", "INPUT", "-p", "tcp", "--dport", "23", "-j", "DROP"])],
            },
            &firewall,
        );

        engine.begin("t").expect("begin");
        run_in(&mut engine, Some(&watchdog), &task).expect("run");
        assert!(!watchdog.armed_marker().exists());
        assert!(engine
            .store()
            .records()
            .expect("records")
            .iter()
            .any(|r| r.kind == crate::store::BackupKind::State));

        assert!(engine.rollback("test").is_clean());
        assert_eq!(
            fs::read_to_string(&log).expect("read"),
            "-A INPUT -p tcp --dport 23 -j DROP\n-D INPUT -p tcp --dport 23 -j DROP\n"
        );
    }

    #[test]
    fn failed_firewall_confirmation_settles_the_guard() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("fw.log");
        let log_s = log.to_string_lossy().into_owned();
        let restored = dir.path().join("restored");
        let restored_s = restored.to_string_lossy().into_owned();
        let system = SystemConfig {
            firewall_command: sh("echo \"$*\" >> \"$0\"", &[&log_s]),
            ..SystemConfig::default()
        };
        let firewall = FirewallConfig {
            save_command: argv(&["echo", "*filter"]),
            restore_command: sh("cp \"$1\" \"$0\"", &[&restored_s, "{dump}"]),
            guard_timeout_secs: 2,
        };
        let channel = ChannelConfig {
            production_address: crate::watchdog::closed_port(),
            probe_timeout_secs: 1,
            ..ChannelConfig::default()
        };
        let state = dir.path().join("state");
        let watchdog =
            Watchdog::new(channel, &state, Box::new(ThreadSpawner)).expect("watchdog");
        let mut engine = engine(dir.path(), system);
        let task = build(
            &TaskKind::Firewall {
                rules: vec![argv(&["-A", "INPUT", "-p", "tcp", "--dport", "23", "-j", "DROP"])],
            },
            &firewall,
        );

        engine.begin("t").expect("begin");
        let err = run_in(&mut engine, Some(&watchdog), &task).expect_err("unconfirmed");
        assert!(matches!(err, LifelineError::ReachabilityTimeout { .. }));
        assert!(!watchdog.armed_marker().exists());
        assert_eq!(fs::read_to_string(&restored).expect("read"), "*filter\n");
        engine.rollback("test");

        // Nothing is left to fire once the deadline passes
        fs::remove_file(&restored).expect("remove");
        std::thread::sleep(std::time::Duration::from_millis(2500));
        assert!(!restored.exists());
        assert!(watchdog.armed_id().expect("armed").is_none());
    }

    #[test]
    fn channel_kinds_need_a_watchdog() {
        let dir = TempDir::new().expect("tempdir");
        let mut engine = engine(dir.path(), SystemConfig::default());
        let task = build(
            &TaskKind::ControlChannel {
                candidate: dir.path().join("candidate"),
            },
            &FirewallConfig::default(),
        );
        engine.begin("t").expect("begin");
        assert!(matches!(
            run_in(&mut engine, None, &task),
            Err(LifelineError::InvalidTask { .. })
        ));
        engine.rollback("test");
    }

    #[test]
    fn configured_tasks_register_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let config = crate::config::Config::from_toml_str(
            r#"
            [[tasks]]
            name = "banner"
            tier = 1
            kind = "command"
            apply = ["true"]
            undo = ["true"]

            [[tasks]]
            name = "motd"
            tier = 2
            depends_on = ["banner"]
            kind = "file"
            path = "/nonexistent/motd"
            content = "authorised use only"
            "#,
        )
        .expect("config");
        let mut orch = Orchestrator::new(
            engine(dir.path(), SystemConfig::default()),
            &dir.path().join("markers"),
        )
        .expect("orchestrator");
        register_configured(&mut orch, &config.tasks, &config.firewall).expect("register");
        assert_eq!(orch.task_names(), vec!["banner", "motd"]);
        assert!(orch.validate().is_ok());
    }
}
