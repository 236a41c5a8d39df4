//! Sliding-window rate limiting for auth flows.
//!
//! Keys are composite identities built by the caller (typically
//! `ip:username`) so different principals behind one address do not share a
//! budget. The limiter only throttles request volume; account lockout is
//! tracked separately on the account record.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// Over budget; `retry_after` is the time until the oldest attempt in the
    /// window falls out.
    Denied { retry_after: Duration },
}

#[derive(Default)]
struct Window {
    attempts: VecDeque<Instant>,
}

impl Window {
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.attempts.front() {
            if now.duration_since(oldest) >= window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window attempt counter.
///
/// The shared map is locked only to look up or insert a key's entry; all
/// per-key mutation happens under that key's own mutex, so contention on one
/// key does not serialize unrelated keys, and concurrent checks on the same
/// key are linearizable (two requests cannot both take the last slot).
pub struct SlidingWindowLimiter {
    max_attempts: u32,
    window: Duration,
    keys: Mutex<HashMap<String, Arc<Mutex<Window>>>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<Window>> {
        let mut keys = self.keys.lock().expect("rate limiter map poisoned");
        keys.entry(key.to_string()).or_default().clone()
    }

    // Read-only lookup; never materializes an entry for an unseen key.
    fn existing_entry(&self, key: &str) -> Option<Arc<Mutex<Window>>> {
        let keys = self.keys.lock().expect("rate limiter map poisoned");
        keys.get(key).cloned()
    }

    /// Check the key's budget and, when allowed, record the attempt.
    pub fn check_and_record(&self, key: &str) -> RateLimitDecision {
        self.check_and_record_at(key, Instant::now())
    }

    /// Attempts left in the current window for `key`.
    #[must_use]
    pub fn remaining_attempts(&self, key: &str) -> u32 {
        self.remaining_attempts_at(key, Instant::now())
    }

    /// Drop keys whose windows have fully drained. Keys with attempts still
    /// inside the window are kept.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    pub(crate) fn check_and_record_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let entry = self.entry(key);
        let mut window = entry.lock().expect("rate limiter window poisoned");
        window.purge(now, self.window);

        if window.attempts.len() >= self.max_attempts as usize {
            let oldest = window
                .attempts
                .front()
                .copied()
                .unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest));
            return RateLimitDecision::Denied { retry_after };
        }

        window.attempts.push_back(now);
        RateLimitDecision::Allowed
    }

    pub(crate) fn remaining_attempts_at(&self, key: &str, now: Instant) -> u32 {
        let Some(entry) = self.existing_entry(key) else {
            return self.max_attempts;
        };
        let mut window = entry.lock().expect("rate limiter window poisoned");
        window.purge(now, self.window);
        self.max_attempts
            .saturating_sub(window.attempts.len() as u32)
    }

    pub(crate) fn cleanup_at(&self, now: Instant) {
        let mut keys = self.keys.lock().expect("rate limiter map poisoned");
        keys.retain(|_, entry| {
            let mut window = entry.lock().expect("rate limiter window poisoned");
            window.purge(now, self.window);
            !window.attempts.is_empty()
        });
    }

    /// Number of keys currently tracked, drained or not.
    pub(crate) fn tracked_keys(&self) -> usize {
        self.keys.lock().expect("rate limiter map poisoned").len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixth_attempt_in_window_is_denied() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        for i in 0..5 {
            let at = start + Duration::from_secs(i);
            assert_eq!(
                limiter.check_and_record_at("1.2.3.4:alice", at),
                RateLimitDecision::Allowed
            );
        }

        let decision = limiter.check_and_record_at("1.2.3.4:alice", start + Duration::from_secs(10));
        let RateLimitDecision::Denied { retry_after } = decision else {
            panic!("expected denial, got {decision:?}");
        };
        // Oldest attempt was at t=0, so the slot frees up at t=60.
        assert_eq!(retry_after, Duration::from_secs(50));
    }

    #[test]
    fn attempt_after_window_elapses_is_allowed() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..5 {
            limiter.check_and_record_at("key", start);
        }
        assert!(matches!(
            limiter.check_and_record_at("key", start + Duration::from_secs(59)),
            RateLimitDecision::Denied { .. }
        ));
        assert_eq!(
            limiter.check_and_record_at("key", start + Duration::from_secs(60)),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn keys_do_not_share_budgets() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(
            limiter.check_and_record_at("1.2.3.4:alice", now),
            RateLimitDecision::Allowed
        );
        // Same address, different principal: separate budget.
        assert_eq!(
            limiter.check_and_record_at("1.2.3.4:bob", now),
            RateLimitDecision::Allowed
        );
        assert!(matches!(
            limiter.check_and_record_at("1.2.3.4:alice", now),
            RateLimitDecision::Denied { .. }
        ));
    }

    #[test]
    fn remaining_attempts_counts_down() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.remaining_attempts_at("key", now), 3);
        limiter.check_and_record_at("key", now);
        limiter.check_and_record_at("key", now);
        assert_eq!(limiter.remaining_attempts_at("key", now), 1);
        assert_eq!(
            limiter.remaining_attempts_at("key", now + Duration::from_secs(60)),
            3
        );
    }

    #[test]
    fn cleanup_keeps_keys_with_live_attempts() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        limiter.check_and_record_at("stale", start);
        limiter.check_and_record_at("live", start + Duration::from_secs(30));
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.cleanup_at(start + Duration::from_secs(61));
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(
            limiter.remaining_attempts_at("live", start + Duration::from_secs(61)),
            4
        );
    }

    #[test]
    fn reading_an_unknown_key_does_not_create_an_entry() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.remaining_attempts_at("never-seen", now), 5);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn concurrent_checks_admit_at_most_the_budget() {
        let limiter = Arc::new(SlidingWindowLimiter::new(5, Duration::from_secs(60)));
        let now = Instant::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.check_and_record_at("shared", now))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked"))
            .filter(|decision| *decision == RateLimitDecision::Allowed)
            .count();
        assert_eq!(admitted, 5);
    }
}
