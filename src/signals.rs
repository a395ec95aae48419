//! SIGINT/SIGTERM handling.
//!
//! The handler only sets a flag. The orchestrator checks it between stages
//! and turns it into a regular stage failure, so the cleanup stack runs on
//! the main thread instead of inside the signal handler. Container waits
//! poll the same flag.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::debug;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::SeqCst);
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the interrupt flag.
pub fn install_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs atomic stores.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
    debug!("signal handlers installed");
}

/// The process-wide interrupt flag, for components that poll it.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Number of the most recent signal, if one arrived.
pub fn last_signal() -> Option<i32> {
    match LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signum => Some(signum),
    }
}

pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
    LAST_SIGNAL.store(0, Ordering::SeqCst);
}
