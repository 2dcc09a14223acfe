//! Per-class dispatch rate limiting.

use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// Token bucket refilled to `max_per_minute` once per minute.
///
/// Owned by a single dispatch loop, so it needs no locking. A limit of zero
/// disables it.
pub struct DispatchRateLimiter {
    max_per_minute: u32,
    tokens: u32,
    window_start: Instant,
}

impl DispatchRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self::starting_at(max_per_minute, Instant::now())
    }

    pub fn starting_at(max_per_minute: u32, now: Instant) -> Self {
        Self {
            max_per_minute,
            tokens: max_per_minute,
            window_start: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_per_minute > 0
    }

    fn refill(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= WINDOW {
            self.tokens = self.max_per_minute;
            self.window_start = now;
        }
    }

    /// When the next token becomes available, or `None` if one is available now.
    pub fn next_available(&mut self, now: Instant) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        self.refill(now);
        if self.tokens > 0 {
            None
        } else {
            Some(self.window_start + WINDOW)
        }
    }

    /// Try to take a token. Returns `true` if allowed, `false` if rate-limited.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}
