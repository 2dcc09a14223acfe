//! Duplicate suppression by producer-supplied dedupe key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Upper bound on remembered keys.
pub const MAX_DEDUPE_ENTRIES: usize = 5_000;

/// Remembers recently admitted dedupe keys for a fixed window.
pub struct Deduper {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Deduper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `key` was remembered less than `ttl` before `now`.
    pub fn is_duplicate(&self, key: &str, now: Instant) -> bool {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.get(key)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.ttl)
    }

    pub fn remember(&self, key: &str, now: Instant) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(key.to_string(), now);

        if seen.len() > MAX_DEDUPE_ENTRIES {
            let ttl = self.ttl;
            seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
        }
        while seen.len() > MAX_DEDUPE_ENTRIES {
            let oldest = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    seen.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
