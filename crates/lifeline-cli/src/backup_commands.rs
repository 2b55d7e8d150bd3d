//! Backup store subcommands

use crate::cli::{BackupArgs, BackupCommands};
use crate::output::{self, prefix};
use crate::runtime::Runtime;
use chrono::{Duration, Utc};
use colored::Colorize;
use lifeline::{BackupKind, BackupRecord, LifelineError, Result, SnapshotInfo};
use std::path::Path;

/// Dispatch to the appropriate backup subcommand.
pub fn run_backup(rt: &Runtime, args: BackupArgs) -> Result<i32> {
    match args.command {
        BackupCommands::File { path } => cmd_file(rt, &path),
        BackupCommands::Dir { path } => cmd_dir(rt, &path),
        BackupCommands::Snapshot { id } => cmd_snapshot(rt, id.as_deref()),
        BackupCommands::List { snapshots, json } => {
            if snapshots {
                cmd_list_snapshots(rt, json)
            } else {
                cmd_list(rt, json)
            }
        }
        BackupCommands::Restore { path } => cmd_restore(rt, &path),
        BackupCommands::RestoreSnapshot { id } => cmd_restore_snapshot(rt, id.as_deref()),
        BackupCommands::Prune { days } => cmd_prune(rt, days),
        BackupCommands::Verify { json } => cmd_verify(rt, json),
    }
}

fn record_json(r: &BackupRecord) -> serde_json::Value {
    serde_json::json!({
        "kind": r.kind.as_str(),
        "source": r.source.display().to_string(),
        "backup": r.backup.display().to_string(),
        "timestamp": r.timestamp.to_rfc3339(),
        "checksum": r.checksum.map(|c| c.to_string()),
    })
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
    );
}

fn cmd_file(rt: &Runtime, path: &Path) -> Result<i32> {
    if rt.dry_run {
        eprintln!("{} [dry-run] would back up {}", prefix(), path.display());
        return Ok(0);
    }
    let record = rt.store()?.backup_file(path)?;
    eprintln!(
        "{} Backed up {} -> {}",
        prefix(),
        path.display(),
        record.backup.display().to_string().truecolor(150, 150, 150)
    );
    Ok(0)
}

fn cmd_dir(rt: &Runtime, path: &Path) -> Result<i32> {
    if rt.dry_run {
        eprintln!("{} [dry-run] would back up tree {}", prefix(), path.display());
        return Ok(0);
    }
    let record = rt.store()?.backup_directory(path)?;
    eprintln!(
        "{} Backed up tree {} -> {}",
        prefix(),
        path.display(),
        record.backup.display().to_string().truecolor(150, 150, 150)
    );
    Ok(0)
}

fn cmd_snapshot(rt: &Runtime, id: Option<&str>) -> Result<i32> {
    if rt.dry_run {
        eprintln!(
            "{} [dry-run] would snapshot {} files and {} states",
            prefix(),
            rt.config.snapshot.files.len(),
            rt.config.snapshot.states.len()
        );
        return Ok(0);
    }
    let info = rt.store()?.create_snapshot(id, &rt.config.snapshot)?;
    eprintln!(
        "{} Snapshot {} created: {} files, {} states",
        prefix(),
        info.id.bold(),
        info.files.len(),
        info.states.len()
    );
    for path in &info.skipped {
        eprintln!("  {} {} (missing)", "skipped".yellow(), path.display());
    }
    println!("{}", info.id);
    Ok(0)
}

fn cmd_list(rt: &Runtime, json: bool) -> Result<i32> {
    let records = rt.store()?.records()?;

    if json {
        let rows: Vec<serde_json::Value> = records.iter().map(record_json).collect();
        print_json(&serde_json::Value::Array(rows));
        return Ok(0);
    }

    if records.is_empty() {
        eprintln!("{} No backups recorded.", prefix());
        return Ok(0);
    }
    for r in &records {
        println!(
            "{}  {:<8}  {}  {}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.kind.as_str(),
            r.source.display(),
            r.checksum
                .map(|c| c.short())
                .unwrap_or_else(|| "-".to_string())
                .truecolor(150, 150, 150)
        );
    }
    Ok(0)
}

fn snapshot_json(info: &SnapshotInfo) -> serde_json::Value {
    serde_json::json!({
        "id": info.id,
        "created": info.created.to_rfc3339(),
        "files": info.files.len(),
        "states": info.states.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
        "skipped": info.skipped.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
    })
}

fn cmd_list_snapshots(rt: &Runtime, json: bool) -> Result<i32> {
    let snapshots = rt.store()?.list_snapshots()?;

    if json {
        let rows: Vec<serde_json::Value> = snapshots.iter().map(snapshot_json).collect();
        print_json(&serde_json::Value::Array(rows));
        return Ok(0);
    }

    if snapshots.is_empty() {
        eprintln!("{} No snapshots.", prefix());
        return Ok(0);
    }
    for s in &snapshots {
        println!(
            "{}  {}  {} files, {} states",
            s.created.format("%Y-%m-%d %H:%M:%S"),
            s.id.bold(),
            s.files.len(),
            s.states.len()
        );
    }
    Ok(0)
}

fn cmd_restore(rt: &Runtime, path: &Path) -> Result<i32> {
    let store = rt.store()?;
    let record = store
        .latest_for(path)?
        .ok_or_else(|| LifelineError::NotFound(format!("backup of {}", path.display())))?;

    eprintln!(
        "{} Latest backup of {} is from {}",
        prefix(),
        path.display(),
        record.timestamp.format("%Y-%m-%d %H:%M:%S")
    );
    if rt.dry_run {
        eprintln!("{} [dry-run] would restore it", prefix());
        return Ok(0);
    }
    if !output::confirm("Overwrite the current contents?", rt.yes) {
        eprintln!("{} Aborted.", prefix());
        return Ok(1);
    }

    match record.kind {
        BackupKind::Directory => {
            let count = store.restore_directory(&record)?;
            eprintln!("{} Restored {} entries under {}", prefix(), count, path.display());
        }
        BackupKind::File | BackupKind::State => {
            store.restore_file(&record)?;
            eprintln!("{} Restored {}", prefix(), path.display());
        }
        BackupKind::Snapshot => {
            return Err(LifelineError::Backup(format!(
                "{} names a snapshot; use `lifeline backup restore-snapshot`",
                path.display()
            )));
        }
    }
    Ok(0)
}

fn cmd_restore_snapshot(rt: &Runtime, id: Option<&str>) -> Result<i32> {
    let store = rt.store()?;
    let info = match id {
        Some(id) => store.find_snapshot(id)?,
        None => store
            .latest_snapshot()?
            .ok_or_else(|| LifelineError::NotFound("any snapshot".to_string()))?,
    };

    eprintln!(
        "{} Snapshot {} from {}: {} files, {} states",
        prefix(),
        info.id.bold(),
        info.created.format("%Y-%m-%d %H:%M:%S"),
        info.files.len(),
        info.states.len()
    );
    if rt.dry_run {
        for f in &info.files {
            eprintln!("  [dry-run] would restore {}", f.source.display());
        }
        return Ok(0);
    }

    let yes = rt.yes;
    let outcome = store.restore_snapshot_info(
        &info,
        &rt.config.snapshot.reload_commands,
        |i: &SnapshotInfo| output::confirm(&format!("Restore snapshot {}?", i.id), yes),
    );
    let report = match outcome {
        Ok(report) => report,
        Err(LifelineError::Aborted(reason)) => {
            eprintln!("{} Aborted: {}", prefix(), reason);
            return Ok(1);
        }
        Err(e) => return Err(e),
    };

    for path in &report.restored {
        eprintln!("  {} {}", "restored".green(), path.display());
    }
    for (path, e) in &report.failed {
        eprintln!("  {} {}: {}", "FAILED".red().bold(), path.display(), e);
    }
    for (what, e) in &report.commands_failed {
        eprintln!("  {} {}: {}", "FAILED".red().bold(), what, e);
    }

    Ok(if report.is_clean() { 0 } else { 1 })
}

fn cmd_prune(rt: &Runtime, days: Option<u32>) -> Result<i32> {
    let days = days.unwrap_or(rt.config.retention.days);
    let store = rt.store()?;

    if rt.dry_run {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let stale = store
            .records()?
            .into_iter()
            .filter(|r| r.timestamp < cutoff)
            .count();
        eprintln!(
            "{} [dry-run] would prune {} record(s) older than {} days",
            prefix(),
            stale,
            days
        );
        return Ok(0);
    }

    let report = store.prune_older_than(days)?;
    eprintln!(
        "{} Pruned {} record(s) older than {} days",
        prefix(),
        report.removed.len(),
        days
    );
    for (path, e) in &report.failed {
        eprintln!("  {} {}: {}", "could not delete".yellow(), path.display(), e);
    }
    Ok(0)
}

fn cmd_verify(rt: &Runtime, json: bool) -> Result<i32> {
    let report = rt.store()?.verify()?;

    if json {
        print_json(&serde_json::json!({
            "ok": report.ok,
            "unchecked": report.unchecked,
            "corrupt": report.corrupt.iter().map(record_json).collect::<Vec<_>>(),
            "missing": report.missing.iter().map(record_json).collect::<Vec<_>>(),
        }));
    } else {
        for r in &report.corrupt {
            eprintln!("  {} {}", "corrupt".red().bold(), r.backup.display());
        }
        for r in &report.missing {
            eprintln!("  {} {}", "missing".red().bold(), r.backup.display());
        }
        eprintln!(
            "{} {} intact, {} corrupt, {} missing, {} without checksum",
            prefix(),
            report.ok,
            report.corrupt.len(),
            report.missing.len(),
            report.unchecked
        );
    }

    Ok(if report.is_clean() { 0 } else { 1 })
}
