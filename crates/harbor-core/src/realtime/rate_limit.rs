//! Fixed-window rate limiting.
//!
//! Each key owns one [`RateLimitEntry`]. Check-and-increment and eviction
//! both run inside the `DashMap` shard lock for that key, so a sweep can
//! never interleave with an in-flight check on the same key.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Window size and budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
    /// Extra lockout after the budget is exhausted. The key stays blocked
    /// until the later of the window reset and `now + block_for`.
    pub block_for: Option<Duration>,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            block_for: None,
        }
    }

    /// One request per second per key; the broadcast default.
    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn with_block(mut self, block_for: Duration) -> Self {
        self.block_for = Some(block_for);
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_second(1)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// When the current window ends.
    pub reset_at: Instant,
    /// Set only when rejected.
    pub retry_after: Option<Duration>,
}

/// Counter state for one key.
#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_reset_at: Instant,
    blocked_until: Option<Instant>,
}

impl RateLimitEntry {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_reset_at: now + window,
            blocked_until: None,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.window_reset_at <= now && self.blocked_until.map_or(true, |b| b <= now)
    }
}

/// Per-key fixed-window rate limiter.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
    default_config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter applying `config` to keys checked without an
    /// explicit config.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_config: config,
        }
    }

    /// Check `key` against the default config and count the request if allowed.
    pub fn check_and_increment(&self, key: &str) -> RateLimitDecision {
        self.check_and_increment_with(key, &self.default_config)
    }

    /// Check `key` against `config` and count the request if allowed.
    pub fn check_and_increment_with(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::fresh(now, config.window));

        if let Some(until) = entry.blocked_until {
            if until > now {
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at: entry.window_reset_at.max(until),
                    retry_after: Some(until - now),
                };
            }
            entry.blocked_until = None;
        }

        if entry.window_reset_at <= now {
            *entry = RateLimitEntry::fresh(now, config.window);
        }

        if entry.count >= config.max_requests {
            let until = match config.block_for {
                Some(block) => entry.window_reset_at.max(now + block),
                None => entry.window_reset_at,
            };
            entry.blocked_until = Some(until);
            tracing::trace!(key, retry_after_ms = (until - now).as_millis() as u64, "Rate limited");
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: entry.window_reset_at,
                retry_after: Some(until - now),
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: config.max_requests - entry.count,
            reset_at: entry.window_reset_at,
            retry_after: None,
        }
    }

    /// Evict windows that have ended and are not blocked. Returns the number
    /// of evicted keys.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "Rate limit sweep");
        }
        evicted
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
