use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use tierkeep_core::{ErrorKind, KeystoreError, Result};
use tracing::warn;

/// Minimum spacing between two full backend enumerations.
pub const DEFAULT_ENUMERATION_INTERVAL: Duration = Duration::from_secs(2);

/// Cooperative cancellation for a throttled wait.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `deadline`; returns `true` if cancelled first.
    fn wait_until(&self, deadline: Instant) -> bool {
        let (flag, signal) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = signal
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Rolling-window limiter for full enumerations.
///
/// Each caller reserves the next free start slot under the lock and then waits for
/// it outside the lock, so concurrent callers are spaced by `interval` as well.
/// A reserved slot counts as an attempt whether or not the enumeration succeeds.
#[derive(Debug)]
pub struct EnumerationThrottle {
    interval: Duration,
    max_wait: Option<Duration>,
    last_start: Mutex<Option<Instant>>,
}

impl Default for EnumerationThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_ENUMERATION_INTERVAL, None)
    }
}

impl EnumerationThrottle {
    pub fn new(interval: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            interval,
            max_wait,
            last_start: Mutex::new(None),
        }
    }

    /// Waits until an enumeration may start.
    ///
    /// Fails with `ThrottleWaitExceeded` without consuming a slot when the wait would
    /// exceed the configured maximum, and with `Cancelled` if `cancel` fires first.
    pub fn acquire(&self, cancel: Option<&CancellationToken>) -> Result<Instant> {
        let now = Instant::now();
        let slot = {
            let mut last = self
                .last_start
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = match *last {
                Some(previous) => (previous + self.interval).max(now),
                None => now,
            };
            let wait = slot - now;
            if let Some(max_wait) = self.max_wait {
                if wait > max_wait {
                    return Err(KeystoreError::new(ErrorKind::ThrottleWaitExceeded {
                        required_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    }));
                }
            }
            *last = Some(slot);
            slot
        };

        if slot > now {
            warn!(wait_ms = (slot - now).as_millis() as u64, "delaying enumeration");
            match cancel {
                Some(token) => {
                    if token.wait_until(slot) {
                        return Err(KeystoreError::new(ErrorKind::Cancelled));
                    }
                }
                None => thread::sleep(slot.saturating_duration_since(Instant::now())),
            }
        } else if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(KeystoreError::new(ErrorKind::Cancelled));
        }
        Ok(slot)
    }
}
