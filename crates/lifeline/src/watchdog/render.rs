//! Recovery-oriented daemon configs
//!
//! OpenSSH uses the first value it reads for most keywords, so the
//! permissive block is prepended. Keywords that accumulate instead (ports,
//! listen addresses) or that would lock a recovery login out are stripped
//! from the base config.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::Path;

/// Keywords removed from the base config (matched case-insensitively)
const STRIPPED_KEYWORDS: &[&str] = &[
    "port",
    "listenaddress",
    "pidfile",
    "allowusers",
    "allowgroups",
    "denyusers",
    "denygroups",
    "authenticationmethods",
];

const PERMISSIVE_DIRECTIVES: &[&str] = &[
    "PermitRootLogin yes",
    "PubkeyAuthentication yes",
    "PasswordAuthentication yes",
    "KbdInteractiveAuthentication yes",
    "MaxAuthTries 10",
    "LoginGraceTime 120",
];

fn keyword(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let word = trimmed
        .split(|c: char| c.is_whitespace() || c == '=')
        .next()?;
    Some(word.to_ascii_lowercase())
}

/// Derive a config bound to `listen` with permissive authentication.
///
/// Everything else in `base` (host keys, subsystems, Match blocks) is kept
/// so the rendered config exercises the same daemon setup as production.
#[must_use]
pub fn render_permissive_config(base: &str, listen: SocketAddr, pid_file: &Path) -> String {
    let mut out = String::with_capacity(base.len() + 512);
    let _ = writeln!(out, "# Rendered by lifeline: recovery instance on {listen}");
    let _ = writeln!(out, "Port {}", listen.port());
    let _ = writeln!(out, "ListenAddress {}", listen.ip());
    let _ = writeln!(out, "PidFile {}", pid_file.display());
    for directive in PERMISSIVE_DIRECTIVES {
        let _ = writeln!(out, "{directive}");
    }
    out.push('\n');

    for line in base.lines() {
        match keyword(line) {
            Some(k) if STRIPPED_KEYWORDS.contains(&k.as_str()) => {
                let _ = writeln!(out, "# lifeline: {}", line.trim());
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}
