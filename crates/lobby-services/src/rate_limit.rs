//! Rate limiting — fixed wall-clock windows per key.
//!
//! Each key (a network origin) gets a bucket `{window_start, count}`.
//! `window_start` is aligned to the window size, so every key rolls over at
//! the same boundary: `now - now % window`. A bucket from an older window is
//! reset, never decremented.
//!
//! The broker keeps two independent limiters: one for new connections
//! and one for invite validations, so token guessing and plain
//! flooding are bounded separately.

use dashmap::DashMap;
use lobby_core::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub window_start: u64,
    pub count: u32,
}

pub struct RateLimiter {
    name: &'static str,
    ceiling: u32,
    window_ms: u64,
    buckets: DashMap<String, RateLimitBucket>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(name: &'static str, ceiling: u32, window_secs: u64, clock: SharedClock) -> Self {
        Self {
            name,
            ceiling,
            window_ms: window_secs.max(1) * 1000,
            buckets: DashMap::new(),
            clock,
        }
    }

    fn current_window(&self) -> u64 {
        let now = self.clock.now_ms();
        now - now % self.window_ms
    }

    /// Count one attempt for `key`. False once the ceiling is reached
    /// within the current window.
    pub fn allow(&self, key: &str) -> bool {
        let window = self.current_window();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(RateLimitBucket {
            window_start: window,
            count: 0,
        });

        if bucket.window_start != window {
            bucket.window_start = window;
            bucket.count = 0;
        }

        if bucket.count >= self.ceiling {
            tracing::debug!(limiter = self.name, key, "rate limited");
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Drop buckets whose window has passed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let window = self.current_window();
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.window_start == window);
        before - self.buckets.len()
    }

    pub fn bucket(&self, key: &str) -> Option<RateLimitBucket> {
        self.buckets.get(key).map(|b| *b.value())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
