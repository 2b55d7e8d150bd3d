//! Bounded reachability probes
//!
//! A probe connects over TCP and requires the server's greeting line to
//! start with the expected prefix (`SSH-` for OpenSSH). Nothing is sent.

use crate::error::{LifelineError, Result};
use std::io::{BufRead, BufReader, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::debug;

/// Pause between attempts while waiting for a server to come up
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Longest greeting line read
const MAX_BANNER: u64 = 255;

/// Replace an unspecified bind address with the matching loopback.
#[must_use]
pub fn connect_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// One probe attempt. Returns the greeting line.
pub fn probe_banner(addr: SocketAddr, prefix: &str, timeout: Duration) -> Result<String> {
    let target = connect_address(addr);
    let timeout = timeout.max(Duration::from_millis(10));
    let unreachable = |detail: String| LifelineError::ReachabilityTimeout {
        address: target.to_string(),
        timeout_secs: timeout.as_secs(),
        detail,
    };

    let stream = TcpStream::connect_timeout(&target, timeout)
        .map_err(|e| unreachable(format!("connect failed: {e}")))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| unreachable(format!("socket setup failed: {e}")))?;

    let mut line = String::new();
    BufReader::new(stream.take(MAX_BANNER))
        .read_line(&mut line)
        .map_err(|e| unreachable(format!("no greeting: {e}")))?;
    let banner = line.trim_end().to_string();

    if banner.starts_with(prefix) {
        debug!("{target} answered: {banner}");
        Ok(banner)
    } else {
        Err(unreachable(format!("unexpected greeting {banner:?}")))
    }
}

/// Retry [`probe_banner`] until it succeeds or `total` elapses.
pub fn wait_for_banner(addr: SocketAddr, prefix: &str, total: Duration) -> Result<String> {
    let started = Instant::now();
    loop {
        let remaining = total.saturating_sub(started.elapsed());
        let attempt = remaining.min(Duration::from_secs(5));
        match probe_banner(addr, prefix, attempt) {
            Ok(banner) => return Ok(banner),
            Err(LifelineError::ReachabilityTimeout { detail, .. })
                if started.elapsed() + RETRY_INTERVAL >= total =>
            {
                return Err(LifelineError::ReachabilityTimeout {
                    address: connect_address(addr).to_string(),
                    timeout_secs: total.as_secs(),
                    detail,
                });
            }
            Err(e) => debug!("probe of {addr} failed, retrying: {e}"),
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

/// Serves a fixed greeting to every connection, for tests.
#[cfg(test)]
pub(crate) fn banner_server(banner: &'static str) -> SocketAddr {
    use std::io::Write;
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    std::thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let _ = stream.write_all(banner.as_bytes());
        }
    });
    addr
}

/// A loopback address nothing listens on, for tests.
#[cfg(test)]
pub(crate) fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_addresses_probe_loopback() {
        let addr: SocketAddr = "0.0.0.0:2222".parse().expect("addr");
        assert_eq!(connect_address(addr), "127.0.0.1:2222".parse().expect("addr"));
        let addr: SocketAddr = "[::]:2222".parse().expect("addr");
        assert_eq!(connect_address(addr), "[::1]:2222".parse().expect("addr"));
        let addr: SocketAddr = "10.0.0.1:22".parse().expect("addr");
        assert_eq!(connect_address(addr), addr);
    }

    #[test]
    fn accepts_matching_banner() {
        let addr = banner_server("SSH-2.0-OpenSSH_9.6\r\n");
        let banner = probe_banner(addr, "SSH-", Duration::from_secs(2)).expect("probe");
        assert_eq!(banner, "SSH-2.0-OpenSSH_9.6");
    }

    #[test]
    fn rejects_wrong_banner() {
        let addr = banner_server("220 smtp ready\r\n");
        assert!(matches!(
            probe_banner(addr, "SSH-", Duration::from_secs(2)),
            Err(LifelineError::ReachabilityTimeout { .. })
        ));
    }

    #[test]
    fn wait_gives_up_after_the_bound() {
        let addr = closed_port();
        let started = Instant::now();
        let err = wait_for_banner(addr, "SSH-", Duration::from_millis(600)).expect_err("closed");
        assert!(matches!(err, LifelineError::ReachabilityTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
