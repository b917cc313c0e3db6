//! Bounded snapshot history.
//!
//! Entries are evicted oldest-first, on every write, once they fall outside
//! the retention window or the count cap is exceeded.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::health::HealthSnapshot;

/// Default retention window.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// One day of snapshots at the default 30s interval.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 2880;

#[derive(Debug, Clone)]
pub struct HealthHistory {
    entries: VecDeque<HealthSnapshot>,
    retention: Duration,
    max_entries: usize,
}

impl HealthHistory {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            retention,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&HealthSnapshot> {
        self.entries.back()
    }

    pub fn push(&mut self, snapshot: HealthSnapshot) {
        let now = snapshot.timestamp;
        self.entries.push_back(snapshot);
        self.prune(now);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = cutoff(now, self.retention);
        while self
            .entries
            .front()
            .is_some_and(|s| s.timestamp < cutoff)
        {
            self.entries.pop_front();
        }
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Snapshots taken within `window` before `now`, oldest first.
    pub fn within(&self, window: Duration, now: DateTime<Utc>) -> Vec<HealthSnapshot> {
        let cutoff = cutoff(now, window);
        self.entries
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }
}

impl Default for HealthHistory {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_MAX_SNAPSHOTS)
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
