//! Cooldown registry.
//!
//! Tracks the last dispatch time per scope key and answers whether a new
//! dispatch may happen now. Keys are `global`, `target:<id>` and
//! `target:<id>|user:<id>`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use cadence_core::config::CooldownIntervals;
use tokio::time::Instant;

/// Entries untouched for this long are dropped on the next write.
const ENTRY_TTL: Duration = Duration::from_secs(60 * 60);

pub const GLOBAL_KEY: &str = "global";

pub fn target_key(target_id: &str) -> String {
    format!("target:{}", target_id)
}

pub fn user_key(target_id: &str, user_id: &str) -> String {
    format!("target:{}|user:{}", target_id, user_id)
}

/// Scope keys paired with their minimum intervals for one dispatch.
///
/// The user key is only included when a user is present.
pub fn scope_requests(
    intervals: CooldownIntervals,
    target_id: &str,
    user_id: Option<&str>,
) -> Vec<(String, Duration)> {
    let mut requests = vec![
        (GLOBAL_KEY.to_string(), Duration::from_millis(intervals.global_ms)),
        (
            target_key(target_id),
            Duration::from_millis(intervals.per_target_ms),
        ),
    ];
    if let Some(user) = user_id.filter(|u| !u.is_empty()) {
        requests.push((
            user_key(target_id, user),
            Duration::from_millis(intervals.per_user_ms),
        ));
    }
    requests
}

/// Outcome of [`CooldownRegistry::check_and_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownCheck {
    pub allowed: bool,
    /// Largest remaining wait across the denied keys. Zero when allowed.
    pub remaining: Duration,
}

impl CooldownCheck {
    pub fn remaining_ms(&self) -> u64 {
        // Round up so a producer retrying after `remaining_ms` is never early.
        let ms = self.remaining.as_millis();
        let ms = if self.remaining.subsec_nanos() % 1_000_000 != 0 {
            ms + 1
        } else {
            ms
        };
        u64::try_from(ms).unwrap_or(u64::MAX)
    }
}

/// Last-dispatch timestamps per scope key.
pub struct CooldownRegistry {
    entries: Mutex<HashMap<String, Instant>>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check every key and, if all pass, stamp them with the current time.
    pub fn check_and_reserve(&self, requests: &[(String, Duration)]) -> CooldownCheck {
        self.check_and_reserve_at(requests, Instant::now())
    }

    /// Same as [`check_and_reserve`](Self::check_and_reserve) with an explicit clock.
    ///
    /// The whole key set is checked and stamped under one lock. Nothing is
    /// stamped on denial. Zero intervals always pass.
    pub fn check_and_reserve_at(&self, requests: &[(String, Duration)], now: Instant) -> CooldownCheck {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let mut remaining = Duration::ZERO;
        for (key, interval) in requests {
            if interval.is_zero() {
                continue;
            }
            if let Some(last) = entries.get(key) {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < *interval {
                    remaining = remaining.max(*interval - elapsed);
                }
            }
        }

        if !remaining.is_zero() {
            return CooldownCheck {
                allowed: false,
                remaining,
            };
        }

        for (key, _) in requests {
            let stamp = entries.entry(key.clone()).or_insert(now);
            // Stamps never move backwards.
            if now > *stamp {
                *stamp = now;
            }
        }
        entries.retain(|_, last| now.saturating_duration_since(*last) < ENTRY_TTL);

        CooldownCheck {
            allowed: true,
            remaining: Duration::ZERO,
        }
    }

    pub fn last_dispatch(&self, key: &str) -> Option<Instant> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CooldownRegistry {
    fn default() -> Self {
        Self::new()
    }
}
