//! Bounded fixed-interval polling for readiness waits.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};

/// How often and how many times to poll before giving up.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_retries: u32,
    /// Abandon the wait once this flag is set.
    pub interrupt: Option<&'static AtomicBool>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_retries: 60,
            interrupt: None,
        }
    }
}

impl PartialEq for PollPolicy {
    fn eq(&self, other: &Self) -> bool {
        let same_flag = match (self.interrupt, other.interrupt) {
            (Some(a), Some(b)) => ptr::eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.interval == other.interval && self.max_retries == other.max_retries && same_flag
    }
}

impl Eq for PollPolicy {}

impl PollPolicy {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            interrupt: None,
        }
    }

    pub fn interruptible(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Call `check` until it returns `true`, sleeping `policy.interval` between
/// attempts. Errors from `check` abort the wait immediately, and so does the
/// policy's interrupt flag, checked before every attempt.
pub fn poll_until<F>(what: &str, policy: &PollPolicy, mut check: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let attempts = policy.max_retries.max(1);
    for attempt in 1..=attempts {
        if policy.interrupted() {
            debug!("stopped waiting for {}: interrupted", what);
            return Err(Error::Interrupted);
        }
        if check()? {
            return Ok(());
        }
        trace!("{} not ready (attempt {}/{})", what, attempt, attempts);
        if attempt < attempts {
            thread::sleep(policy.interval);
        }
    }
    Err(Error::Timeout {
        what: what.to_string(),
        attempts,
    })
}
