use dashmap::DashMap;
use prometheus::Gauge;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{DEFAULT, RateLimitConfig};
use crate::error::RateLimitError;
use crate::metrics::{RATE_LIMIT_CHECKS, STORE_SIZE};

// Rate limit entry - tracks requests per key in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: u64, // epoch ms when the window ends
}

/// Result of one check against a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub limited: bool,
    pub remaining: u32,
    pub reset_time: u64,
    pub key: String,
    /// The `now` the check ran at, epoch ms.
    pub checked_at: u64,
}

impl RateLimitOutcome {
    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_time.saturating_sub(self.checked_at).div_ceil(1000)
    }
}

/// Build the composite key for a counter.
///
/// `{action}:{ip}` for the IP scope, `{action}:{ip}:{identifier}` when an
/// identifier is given. The IP is used verbatim.
pub fn rate_limit_key(ip: &str, action: &str, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) if !id.is_empty() => format!("{}:{}:{}", action, ip, id),
        _ => format!("{}:{}", action, ip),
    }
}

/// Fixed-window counters kept in process memory.
///
/// Each instance owns its own store, so separate processes (or separate
/// limiters) never see each other's counts.
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
    size_gauge: Gauge,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            size_gauge: STORE_SIZE.clone(),
        }
    }

    /// Report the store size to `gauge` instead of the process-wide one.
    pub fn with_size_gauge(mut self, gauge: Gauge) -> Self {
        self.size_gauge = gauge;
        self
    }

    pub fn now_ms(&self) -> Result<u64, RateLimitError> {
        self.clock.now_ms()
    }

    /// Count one request against `key` and report whether it is over the limit.
    ///
    /// The request that brings the count to exactly `max_requests` is still
    /// allowed. An entry whose `reset_time` is already in the past is replaced
    /// by a fresh window before counting.
    pub fn check_rate_limit(
        &self,
        key: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<RateLimitOutcome, RateLimitError> {
        let config = config.unwrap_or(&DEFAULT);
        let now = self.clock.now_ms()?;
        let fresh_reset = config
            .window_size_in_seconds
            .checked_mul(1000)
            .and_then(|window_ms| now.checked_add(window_ms))
            .ok_or_else(|| RateLimitError::WindowOverflow {
                key: key.to_string(),
            })?;

        RATE_LIMIT_CHECKS.inc();

        // The entry guard holds the shard lock, so read-modify-write is atomic per key.
        let mut inserted = false;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                inserted = true;
                RateLimitEntry {
                    count: 0,
                    reset_time: fresh_reset,
                }
            });

        // window expired..? start a new one
        if entry.reset_time < now {
            *entry = RateLimitEntry {
                count: 0,
                reset_time: fresh_reset,
            };
        }

        entry.count = entry.count.saturating_add(1);

        let outcome = RateLimitOutcome {
            limited: entry.count > config.max_requests,
            remaining: config.max_requests.saturating_sub(entry.count),
            reset_time: entry.reset_time,
            key: key.to_string(),
            checked_at: now,
        };

        // len() takes every shard lock; the entry guard must be gone first
        drop(entry);
        if inserted {
            self.size_gauge.set(self.entries.len() as f64);
        }

        Ok(outcome)
    }

    /// Drop every entry whose window has already ended. Returns how many went.
    pub fn sweep(&self) -> Result<usize, RateLimitError> {
        let now = self.clock.now_ms()?;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_time >= now);
        let after = self.entries.len();
        self.size_gauge.set(after as f64);
        Ok(before.saturating_sub(after))
    }

    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
