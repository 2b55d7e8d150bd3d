//! Termination signal capture
//!
//! SIGINT, SIGTERM and SIGHUP do not kill the process while a run is in
//! progress. The handler only records which signal arrived; the orchestrator
//! polls [`termination_requested`] between tasks, rolls the open transaction
//! back and stops.

use nix::libc;
use nix::sys::signal::{self, Signal};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::debug;

// Signal handlers cannot reach instance data, so the request lives in a
// process-global atomic.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(sig: libc::c_int) {
    PENDING_SIGNAL.store(sig, Ordering::SeqCst);
}

/// Install the recording handler for SIGINT, SIGTERM and SIGHUP.
pub fn install_termination_handlers() {
    // SAFETY: the handler only performs an atomic store, which is
    // async-signal-safe.
    unsafe {
        for sig in &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            if let Err(e) = signal::signal(*sig, signal::SigHandler::Handler(record_signal)) {
                debug!("Failed to install handler for {:?}: {}", sig, e);
            }
        }
    }
}

/// The signal received since the last [`clear_termination_request`], if any.
#[must_use]
pub fn termination_requested() -> Option<Signal> {
    match PENDING_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

pub fn clear_termination_request() {
    PENDING_SIGNAL.store(0, Ordering::SeqCst);
}

/// Record a request as if the signal had arrived.
pub fn request_termination(sig: Signal) {
    PENDING_SIGNAL.store(sig as i32, Ordering::SeqCst);
}
