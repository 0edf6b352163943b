//! Keyed, time-windowed throttles shared by every request in the process.
//!
//! A throttle is identified by a [`ThrottleKey`] (who, which operation class) and
//! allows `limit` admissions until its window closes. Expiry is evaluated lazily on
//! every read; [`RateLimiter::purge_expired`] only reclaims memory.

use crate::clock::SharedClock;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub subject: String,
    pub bucket: String,
}

impl ThrottleKey {
    pub fn new(subject: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            bucket: bucket.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleEntry {
    pub limit: u32,
    pub hits: u32,
    pub expires_at: DateTime<Utc>,
}

impl ThrottleEntry {
    fn fresh(limit: u32, expires_at: DateTime<Utc>) -> Self {
        Self {
            limit: limit.max(1),
            hits: 1,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.hits >= self.limit
    }
}

pub struct RateLimiter {
    entries: DashMap<ThrottleKey, ThrottleEntry>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// True while an unexpired throttle for `(subject, bucket)` has used its whole budget.
    pub fn is_throttled(&self, subject: &str, bucket: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(&ThrottleKey::new(subject, bucket))
            .map(|entry| !entry.is_expired(now) && entry.is_exhausted())
            .unwrap_or(false)
    }

    /// Record one admission against `(subject, bucket)`.
    ///
    /// An absent or expired entry starts a new window ending at `expires_at`. A live
    /// entry with budget left counts the hit and keeps the later expiry. Returns false
    /// without touching the entry when the budget is already spent.
    pub fn add_throttle(
        &self,
        subject: &str,
        bucket: &str,
        value: u32,
        expires_at: DateTime<Utc>,
    ) -> bool {
        let now = self.clock.now();
        match self.entries.entry(ThrottleKey::new(subject, bucket)) {
            Entry::Vacant(vacant) => {
                vacant.insert(ThrottleEntry::fresh(value, expires_at));
                true
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = ThrottleEntry::fresh(value, expires_at);
                    true
                } else if entry.is_exhausted() {
                    false
                } else {
                    entry.hits += 1;
                    entry.expires_at = entry.expires_at.max(expires_at);
                    true
                }
            }
        }
    }

    pub fn entry(&self, subject: &str, bucket: &str) -> Option<ThrottleEntry> {
        self.entries
            .get(&ThrottleKey::new(subject, bucket))
            .map(|entry| *entry)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Purged expired throttles");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        (RateLimiter::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_unknown_key_is_not_throttled() {
        let (limiter, _) = limiter();
        assert!(!limiter.is_throttled("10.0.0.1", "report-3min"));
    }

    #[test]
    fn test_single_admission_throttles_until_expiry() {
        let (limiter, clock) = limiter();
        let expires = clock.now() + Duration::minutes(3);

        assert!(limiter.add_throttle("10.0.0.1", "report-3min", 1, expires));
        assert!(limiter.is_throttled("10.0.0.1", "report-3min"));

        // Boundary instant is still inside the window
        clock.advance(Duration::minutes(3));
        assert!(limiter.is_throttled("10.0.0.1", "report-3min"));

        clock.advance(Duration::seconds(1));
        assert!(!limiter.is_throttled("10.0.0.1", "report-3min"));
    }

    #[test]
    fn test_buckets_and_subjects_are_independent() {
        let (limiter, clock) = limiter();
        let expires = clock.now() + Duration::hours(12);
        limiter.add_throttle("10.0.0.1", "report-12h", 1, expires);

        assert!(!limiter.is_throttled("10.0.0.1", "report-3min"));
        assert!(!limiter.is_throttled("10.0.0.2", "report-12h"));
    }

    #[test]
    fn test_structured_key_does_not_collide() {
        let (limiter, clock) = limiter();
        let expires = clock.now() + Duration::hours(1);
        limiter.add_throttle("a:b", "c", 1, expires);
        assert!(!limiter.is_throttled("a", "b:c"));
    }

    #[test]
    fn test_limit_counts_admissions() {
        let (limiter, clock) = limiter();
        let expires = clock.now() + Duration::minutes(10);

        assert!(limiter.add_throttle("peer", "burst", 3, expires));
        assert!(!limiter.is_throttled("peer", "burst"));
        assert!(limiter.add_throttle("peer", "burst", 3, expires));
        assert!(limiter.add_throttle("peer", "burst", 3, expires));
        assert!(limiter.is_throttled("peer", "burst"));
        assert!(!limiter.add_throttle("peer", "burst", 3, expires));
        assert_eq!(limiter.entry("peer", "burst").unwrap().hits, 3);
    }

    #[test]
    fn test_expired_entry_is_renewed() {
        let (limiter, clock) = limiter();
        limiter.add_throttle("peer", "b", 1, clock.now() + Duration::minutes(1));
        clock.advance(Duration::minutes(2));

        let renewed = clock.now() + Duration::minutes(5);
        assert!(limiter.add_throttle("peer", "b", 1, renewed));
        assert_eq!(limiter.entry("peer", "b").unwrap().expires_at, renewed);
        assert!(limiter.is_throttled("peer", "b"));
    }

    #[test]
    fn test_purge_expired() {
        let (limiter, clock) = limiter();
        limiter.add_throttle("a", "short", 1, clock.now() + Duration::minutes(3));
        limiter.add_throttle("a", "long", 1, clock.now() + Duration::hours(12));
        assert_eq!(limiter.len(), 2);

        clock.advance(Duration::minutes(4));
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.is_throttled("a", "long"));
    }

    #[test]
    fn test_concurrent_admissions_respect_budget() {
        let (limiter, clock) = limiter();
        let expires = clock.now() + Duration::minutes(3);
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if limiter.add_throttle("10.1.1.1", "report-3min", 5, expires) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 5);
        assert!(limiter.is_throttled("10.1.1.1", "report-3min"));
    }
}
