//! Time-windowed set of recently seen error keys.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub key: String,
    pub seen_at: Instant,
}

/// Keys seen within the last `cooldown`, oldest first.
///
/// Entries are only ever appended with a non-decreasing timestamp, so pruning
/// stops at the first entry that is still inside the window. At most
/// `capacity` entries are kept; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct RecentErrors {
    entries: VecDeque<ErrorRecord>,
    cooldown: Duration,
    capacity: usize,
}

impl RecentErrors {
    pub fn new(cooldown: Duration) -> Self {
        Self::with_capacity(cooldown, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(cooldown: Duration, capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            cooldown,
            capacity: capacity.max(1),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Drop every entry strictly older than the cooldown.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.seen_at) > self.cooldown {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|r| r.key == key)
    }

    pub fn insert(&mut self, key: impl Into<String>, now: Instant) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ErrorRecord {
            key: key.into(),
            seen_at: now,
        });
    }

    /// Prune, then report whether `key` is a duplicate. A key that is not a
    /// duplicate is recorded at `now`; a duplicate leaves the window as is.
    pub fn check_and_insert(&mut self, key: &str, now: Instant) -> bool {
        self.prune(now);
        if self.contains(key) {
            return true;
        }
        self.insert(key, now);
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
