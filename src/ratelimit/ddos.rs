//! Per-IP abuse counter with temporary bans

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Counter {
    count: u32,
    window_start: Instant,
}

pub struct DdosGuard {
    threshold: u32,
    window: Duration,
    ban_duration: Duration,
    counters: DashMap<String, Arc<Mutex<Counter>>>,
    bans: DashMap<String, Instant>,
}

impl DdosGuard {
    pub fn new(threshold: u32, window: Duration, ban_duration: Duration) -> Self {
        Self {
            threshold,
            window,
            ban_duration,
            counters: DashMap::new(),
            bans: DashMap::new(),
        }
    }

    /// Remaining ban for `ip`, if one is in force.
    pub fn banned_for(&self, ip: &str, now: Instant) -> Option<Duration> {
        let until = *self.bans.get(ip)?;
        if until > now {
            Some(until - now)
        } else {
            None
        }
    }

    /// Count one request from `ip`. Returns the ban length if `ip` is (now) banned.
    pub fn record_at(&self, ip: &str, now: Instant) -> Option<Duration> {
        if let Some(remaining) = self.banned_for(ip, now) {
            return Some(remaining);
        }

        let counter = match self.counters.get(ip) {
            Some(c) => c.clone(),
            None => self
                .counters
                .entry(ip.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Counter {
                        count: 0,
                        window_start: now,
                    }))
                })
                .clone(),
        };

        let tripped = {
            let mut c = counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if now.saturating_duration_since(c.window_start) >= self.window {
                c.count = 0;
                c.window_start = now;
            }
            c.count = c.count.saturating_add(1);
            if c.count > self.threshold {
                c.count = 0;
                c.window_start = now;
                true
            } else {
                false
            }
        };

        if tripped {
            self.bans.insert(ip.to_string(), now + self.ban_duration);
            tracing::warn!(
                ip = %ip,
                threshold = self.threshold,
                ban_seconds = self.ban_duration.as_secs(),
                "DDoS protection triggered"
            );
            return Some(self.ban_duration);
        }
        None
    }

    /// Drop elapsed bans and idle counters.
    pub fn sweep_expired(&self, now: Instant) {
        self.bans.retain(|_, until| *until > now);
        self.counters.retain(|_, c| {
            c.lock()
                .map(|c| now.saturating_duration_since(c.window_start) < self.window)
                .unwrap_or(false)
        });
    }

    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const BAN: Duration = Duration::from_secs(30 * 60);

    #[test]
    fn test_threshold_exceeded_installs_ban() {
        let guard = DdosGuard::new(100, MINUTE, BAN);
        let t0 = Instant::now();
        for i in 0..100 {
            assert!(guard.record_at("9.9.9.9", t0 + Duration::from_millis(i)).is_none());
        }
        assert_eq!(guard.record_at("9.9.9.9", t0 + Duration::from_millis(200)), Some(BAN));

        let later = t0 + Duration::from_secs(10 * 60);
        let remaining = guard.banned_for("9.9.9.9", later).unwrap();
        assert!(remaining <= BAN - Duration::from_secs(9 * 60));
        assert!(guard.record_at("9.9.9.9", later).is_some());
        assert!(guard.record_at("8.8.8.8", later).is_none());

        let after_ban = t0 + BAN + Duration::from_secs(1);
        assert!(guard.banned_for("9.9.9.9", after_ban).is_none());
        assert!(guard.record_at("9.9.9.9", after_ban).is_none());
    }

    #[test]
    fn test_counter_resets_each_window() {
        let guard = DdosGuard::new(3, MINUTE, BAN);
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(guard.record_at("ip", t0).is_none());
        }
        // New window, counter starts over.
        for _ in 0..3 {
            assert!(guard.record_at("ip", t0 + MINUTE).is_none());
        }
        assert_eq!(guard.ban_count(), 0);
    }

    #[test]
    fn test_sweep_drops_elapsed_bans() {
        let guard = DdosGuard::new(0, MINUTE, Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(guard.record_at("ip", t0).is_some());
        assert_eq!(guard.ban_count(), 1);
        guard.sweep_expired(t0 + Duration::from_secs(6));
        assert_eq!(guard.ban_count(), 0);
    }
}
