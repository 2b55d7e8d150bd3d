//! External command execution
//!
//! lifeline never re-implements subsystem tooling; it shells out to it.
//! Commands are configured as argv templates whose `{placeholder}` tokens are
//! substituted before execution. No shell is involved unless the template
//! itself names one.

use crate::error::{LifelineError, Result};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Substitute `{key}` placeholders in every argument of a template.
#[must_use]
pub fn render(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (key, value) in vars {
                out = out.replace(&format!("{{{key}}}"), value);
            }
            out
        })
        .collect()
}

/// Render a template with a single `{config}`-style path placeholder.
#[must_use]
pub fn render_path(template: &[String], key: &str, path: &Path) -> Vec<String> {
    let value = path.to_string_lossy();
    render(template, &[(key, value.as_ref())])
}

/// Human-readable form of an argv for logs and errors.
#[must_use]
pub fn argv_display(argv: &[String]) -> String {
    argv.join(" ")
}

fn command_for(argv: &[String]) -> Result<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| LifelineError::CommandSpawn {
        command: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run a command to completion, failing on a non-zero exit.
pub fn run(argv: &[String]) -> Result<Output> {
    debug!("exec: {}", argv_display(argv));
    let output = command_for(argv)?
        .stdin(Stdio::null())
        .output()
        .map_err(|source| LifelineError::CommandSpawn {
            command: argv_display(argv),
            source,
        })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(LifelineError::CommandFailed {
            command: argv_display(argv),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a command and return its stdout.
pub fn capture(argv: &[String]) -> Result<Vec<u8>> {
    run(argv).map(|output| output.stdout)
}

/// Run a command and report only whether it exited 0.
///
/// Spawn failures count as "no".
#[must_use]
pub fn succeeds(argv: &[String]) -> bool {
    match command_for(argv) {
        Ok(mut cmd) => cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Start a long-running command without waiting for it.
pub fn spawn(argv: &[String]) -> Result<std::process::Child> {
    debug!("spawn: {}", argv_display(argv));
    command_for(argv)?
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| LifelineError::CommandSpawn {
            command: argv_display(argv),
            source,
        })
}
