//! Sliding-window counters keyed by identifier
//!
//! Evict, count and admit happen under one per-key mutex, so concurrent
//! requests for the same key can never push its entry count past the limit.
//! Different keys never contend.

use super::RateLimitDecision;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Window {
    entries: VecDeque<Instant>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct SlidingWindow {
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        self.check_at(key, limit, window, Instant::now())
    }

    /// Admit or reject one request for `key` at `now`.
    pub fn check_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> RateLimitDecision {
        loop {
            let entry = self.window_entry(key, window, now);
            if let Some(decision) = self.admit(key, &entry, limit, window, now) {
                return decision;
            }
        }
    }

    fn window_entry(&self, key: &str, window: Duration, now: Instant) -> Arc<Mutex<Window>> {
        if let Some(existing) = self.windows.get(key) {
            return existing.clone();
        }
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Window {
                    entries: VecDeque::new(),
                    expires_at: now + window,
                }))
            })
            .clone()
    }

    /// `None` when `entry` was swept or removed before its lock was taken.
    fn admit(
        &self,
        key: &str,
        entry: &Arc<Mutex<Window>>,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> Option<RateLimitDecision> {
        let mut w = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self
            .windows
            .get(key)
            .map(|e| Arc::ptr_eq(e.value(), entry))
            .unwrap_or(false);
        if !current {
            return None;
        }

        while let Some(oldest) = w.entries.front() {
            if now.saturating_duration_since(*oldest) >= window {
                w.entries.pop_front();
            } else {
                break;
            }
        }

        let count = w.entries.len() as u32;
        if count >= limit {
            let retry_after = w
                .entries
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now))
                .unwrap_or(window);
            return Some(RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_after: retry_after,
                retry_after: Some(retry_after),
            });
        }

        w.entries.push_back(now);
        w.expires_at = now + window;
        let reset_after = w
            .entries
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or(window);

        Some(RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - count - 1,
            reset_after,
            retry_after: None,
        })
    }

    /// Number of live entries for `key`, without admitting anything.
    pub fn count_at(&self, key: &str, window: Duration, now: Instant) -> usize {
        let entry = self.windows.get(key).map(|e| e.value().clone());
        entry
            .map(|e| {
                let w = e.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                w.entries
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn remove(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Remove every key whose prefix matches.
    pub fn remove_prefix(&self, prefix: &str) {
        self.windows.retain(|k, _| !k.starts_with(prefix));
    }

    /// Drop windows that have seen no admitted request for a full window.
    /// A window locked by an in-flight check is kept.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| match w.try_lock() {
            Ok(w) => w.expires_at > now,
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().expires_at > now,
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn test_fourth_request_in_window_is_rejected() {
        let sw = SlidingWindow::new();
        let t0 = Instant::now();

        let first = sw.check_at("ip:1", 3, FIFTEEN_MIN, t0);
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);
        assert!(sw.check_at("ip:1", 3, FIFTEEN_MIN, t0 + Duration::from_secs(60)).allowed);
        let third = sw.check_at("ip:1", 3, FIFTEEN_MIN, t0 + Duration::from_secs(120));
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = sw.check_at("ip:1", 3, FIFTEEN_MIN, t0 + Duration::from_secs(180));
        assert!(!fourth.allowed);
        // Oldest admitted request (t0) ages out at t0 + 15m.
        assert_eq!(fourth.retry_after, Some(Duration::from_secs(12 * 60)));
        assert_eq!(sw.count_at("ip:1", FIFTEEN_MIN, t0 + Duration::from_secs(180)), 3);
    }

    #[test]
    fn test_window_slides() {
        let sw = SlidingWindow::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(10);
        assert!(sw.check_at("k", 2, window, t0).allowed);
        assert!(sw.check_at("k", 2, window, t0 + Duration::from_secs(5)).allowed);
        assert!(!sw.check_at("k", 2, window, t0 + Duration::from_secs(9)).allowed);
        // t0 has aged out; t0+5 still counts.
        let later = sw.check_at("k", 2, window, t0 + Duration::from_secs(10));
        assert!(later.allowed);
        assert_eq!(later.remaining, 0);
    }

    #[test]
    fn test_keys_are_independent_and_swept() {
        let sw = SlidingWindow::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(1);
        assert!(sw.check_at("a", 1, window, t0).allowed);
        assert!(!sw.check_at("a", 1, window, t0).allowed);
        assert!(sw.check_at("b", 1, window, t0).allowed);
        assert_eq!(sw.len(), 2);

        assert_eq!(sw.sweep_expired(t0 + Duration::from_secs(2)), 2);
        assert!(sw.is_empty());
    }

    #[test]
    fn test_swept_window_is_not_admitted_into() {
        let sw = SlidingWindow::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(10);

        // A check that grabbed the window just before the sweep removed it.
        let stale = sw.window_entry("k", window, t0);
        assert_eq!(sw.sweep_expired(t0 + Duration::from_secs(11)), 1);
        assert!(sw.admit("k", &stale, 1, window, t0).is_none());
        assert!(stale.lock().unwrap().entries.is_empty());

        let later = t0 + Duration::from_secs(11);
        assert!(sw.check_at("k", 1, window, later).allowed);
        assert!(!sw.check_at("k", 1, window, later).allowed);
        assert_eq!(sw.count_at("k", window, later), 1);
    }

    #[test]
    fn test_sweep_keeps_window_held_by_check() {
        let sw = SlidingWindow::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(1);
        let held = sw.window_entry("busy", window, t0);
        sw.window_entry("idle", window, t0);

        let guard = held.lock().unwrap();
        assert_eq!(sw.sweep_expired(t0 + Duration::from_secs(5)), 1);
        drop(guard);
        assert_eq!(sw.len(), 1);
        assert!(sw.admit("busy", &held, 1, window, t0).is_some());
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let sw = Arc::new(SlidingWindow::new());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let sw = sw.clone();
                std::thread::spawn(move || sw.check("shared", 10, Duration::from_secs(60)).allowed)
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_remove_prefix() {
        let sw = SlidingWindow::new();
        sw.check("plugin:echo", 5, Duration::from_secs(1));
        sw.check("endpoint:echo:/ping:user:1", 5, Duration::from_secs(1));
        sw.check("plugin:other", 5, Duration::from_secs(1));
        sw.remove_prefix("plugin:echo");
        assert_eq!(sw.len(), 2);
        sw.remove("plugin:other");
        assert_eq!(sw.len(), 1);
    }
}
