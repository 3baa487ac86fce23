use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::RateLimitError;

/// Source of "now" for the limiter, in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Result<u64, RateLimitError>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Result<u64, RateLimitError> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RateLimitError::Clock(e.to_string()))?;
        u64::try_from(since_epoch.as_millis()).map_err(|e| RateLimitError::Clock(e.to_string()))
    }
}

/// Clock that only moves when told to. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    failing: AtomicBool,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Result<u64, RateLimitError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RateLimitError::Clock("manual clock set to fail".into()));
        }
        Ok(self.now.load(Ordering::SeqCst))
    }
}
