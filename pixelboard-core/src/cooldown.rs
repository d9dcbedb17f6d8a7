//! Per-user cooldown between accepted pixel updates.
//!
//! `check_and_record` holds the DashMap entry lock for the user's key while it
//! compares and writes the timestamp, so two concurrent calls for one user
//! can never both be allowed inside the same window. A caller whose request
//! later fails hands its [`CooldownPermit`] back through [`CooldownTracker::revert`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Proof that a user's cooldown slot was claimed at `recorded_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownPermit {
    user_id: String,
    recorded_at: Instant,
    previous: Option<Instant>,
}

impl CooldownPermit {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn recorded_at(&self) -> Instant {
        self.recorded_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownDecision {
    Allowed(CooldownPermit),
    Denied { retry_after: Duration },
}

impl CooldownDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CooldownDecision::Allowed(_))
    }
}

pub struct CooldownTracker {
    window: Duration,
    entries: DashMap<String, Instant>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Atomically check the user's window and, if it has elapsed, record `now`.
    pub fn check_and_record(&self, user_id: &str, now: Instant) -> CooldownDecision {
        match self.entries.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let last = *entry.get();
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.window {
                    return CooldownDecision::Denied {
                        retry_after: self.window - elapsed,
                    };
                }
                entry.insert(now);
                CooldownDecision::Allowed(CooldownPermit {
                    user_id: user_id.to_string(),
                    recorded_at: now,
                    previous: Some(last),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                CooldownDecision::Allowed(CooldownPermit {
                    user_id: user_id.to_string(),
                    recorded_at: now,
                    previous: None,
                })
            }
        }
    }

    /// Undo a claim whose update was not applied.
    ///
    /// Only restores the previous timestamp if the entry still holds the
    /// permit's own timestamp. Returns whether anything changed.
    pub fn revert(&self, permit: CooldownPermit) -> bool {
        match self.entries.entry(permit.user_id) {
            Entry::Occupied(mut entry) if *entry.get() == permit.recorded_at => {
                match permit.previous {
                    Some(prev) => {
                        entry.insert(prev);
                    }
                    None => {
                        entry.remove();
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Remaining wait for `user_id`, if any. Read-only.
    pub fn retry_after(&self, user_id: &str, now: Instant) -> Option<Duration> {
        let last = *self.entries.get(user_id)?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    /// Drop entries whose window has fully elapsed. Returns how many went.
    pub fn prune(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, last| {
            let keep = now.saturating_duration_since(*last) < self.window;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            log::debug!("Pruned {removed} expired cooldown entries");
        }
        removed
    }

    pub fn tracked_users(&self) -> usize {
        self.entries.len()
    }
}
