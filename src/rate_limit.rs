use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Longest window the limiter will track; larger values are clamped.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-client window state.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Admitted { remaining: u32 },
    Rejected { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Fixed-window request counter keyed by client identifier.
///
/// The counter resets sharply at the window boundary, so a client can fire
/// `max_requests` at the end of one window and again at the start of the next.
/// Check-and-increment happens while holding the shard lock for that key, so
/// concurrent requests from one client cannot both slip in under the limit.
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    /// `max_requests` below one is treated as one, `window` is capped at [`MAX_WINDOW`].
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_requests: max_requests.max(1),
            window: window.min(MAX_WINDOW),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// `true` admits the request and consumes one slot; `false` leaves the entry untouched.
    pub fn admit(&self, identifier: &str) -> bool {
        self.check(identifier).is_admitted()
    }

    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        self.check_at(identifier, Instant::now())
    }

    pub fn check_at(&self, identifier: &str, now: Instant) -> RateLimitDecision {
        match self.entries.entry(identifier.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(self.fresh_entry(now));
                RateLimitDecision::Admitted {
                    remaining: self.max_requests - 1,
                }
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();

                // window over? start a new one
                if entry.expires_at <= now {
                    *entry = self.fresh_entry(now);
                    return RateLimitDecision::Admitted {
                        remaining: self.max_requests - 1,
                    };
                }

                if entry.count >= self.max_requests {
                    return RateLimitDecision::Rejected {
                        retry_after: entry.expires_at - now,
                    };
                }

                entry.count += 1;
                RateLimitDecision::Admitted {
                    remaining: self.max_requests - entry.count,
                }
            }
        }
    }

    fn fresh_entry(&self, now: Instant) -> RateLimitEntry {
        // unrepresentable expiry: the entry lapses on the next check
        let expires_at = now.checked_add(self.window).unwrap_or(now);
        RateLimitEntry {
            count: 1,
            expires_at,
        }
    }

    /// Drop entries whose window has already closed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

/// Periodically evict expired entries so the map does not grow with every
/// identifier ever seen.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        info!("🧹 Rate limit sweeper started (interval: {:?})", every);

        loop {
            ticker.tick().await;
            let removed = limiter.sweep_expired();
            if removed > 0 {
                debug!(
                    "Swept {} expired rate limit entries, {} still tracked",
                    removed,
                    limiter.tracked_clients()
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_sixth_request_in_window_is_rejected() {
        let limiter = RateLimiter::new(5, WINDOW);
        let start = Instant::now();

        for i in 0..5 {
            let now = start + Duration::from_secs(i);
            assert!(
                limiter.check_at("1.2.3.4", now).is_admitted(),
                "request {} should be admitted",
                i + 1
            );
        }

        let decision = limiter.check_at("1.2.3.4", start + Duration::from_secs(10));
        assert_eq!(
            decision,
            RateLimitDecision::Rejected {
                retry_after: Duration::from_secs(50)
            }
        );
    }

    #[test]
    fn test_rejection_leaves_count_unchanged() {
        let limiter = RateLimiter::new(2, WINDOW);
        let start = Instant::now();

        assert!(limiter.check_at("a", start).is_admitted());
        assert!(limiter.check_at("a", start).is_admitted());
        for _ in 0..10 {
            assert!(!limiter.check_at("a", start).is_admitted());
        }

        let entry = *limiter.entries.get("a").unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(entry.expires_at, start + WINDOW);
    }

    #[test]
    fn test_counter_resets_after_window() {
        let limiter = RateLimiter::new(5, WINDOW);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("client", start).is_admitted());
        }
        assert!(!limiter.check_at("client", start + Duration::from_secs(59)).is_admitted());

        let next_window = start + WINDOW;
        assert_eq!(
            limiter.check_at("client", next_window),
            RateLimitDecision::Admitted { remaining: 4 }
        );
        assert_eq!(limiter.entries.get("client").unwrap().expires_at, next_window + WINDOW);
    }

    #[test]
    fn test_burst_at_window_boundary_is_allowed() {
        let limiter = RateLimiter::new(5, WINDOW);
        let start = Instant::now();
        let end_of_window = start + Duration::from_secs(59);

        assert!(limiter.check_at("burst", start).is_admitted());
        for _ in 0..4 {
            assert!(limiter.check_at("burst", end_of_window).is_admitted());
        }
        for _ in 0..5 {
            assert!(limiter.check_at("burst", start + WINDOW).is_admitted());
        }
        assert!(!limiter.check_at("burst", start + WINDOW).is_admitted());
    }

    #[test]
    fn test_identifiers_do_not_share_budget() {
        let limiter = RateLimiter::new(5, WINDOW);

        for _ in 0..5 {
            assert!(limiter.admit("A"));
        }
        assert!(!limiter.admit("A"));
        assert!(limiter.admit("B"));
    }

    #[test]
    fn test_sweep_removes_only_expired_entries() {
        let limiter = RateLimiter::new(5, WINDOW);
        let start = Instant::now();

        limiter.check_at("old", start);
        limiter.check_at("fresh", start + Duration::from_secs(30));
        assert_eq!(limiter.tracked_clients(), 2);

        let removed = limiter.sweep_expired_at(start + Duration::from_secs(61));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert!(limiter.entries.contains_key("fresh"));
    }

    #[test]
    fn test_huge_window_is_clamped_instead_of_overflowing() {
        let limiter = RateLimiter::new(5, Duration::MAX);
        assert_eq!(limiter.window(), MAX_WINDOW);

        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_at("a", start).is_admitted());
        }
        let decision = limiter.check_at("a", start + Duration::from_secs(1));
        assert_eq!(
            decision,
            RateLimitDecision::Rejected {
                retry_after: MAX_WINDOW - Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_zero_max_requests_admits_one() {
        let limiter = RateLimiter::new(0, WINDOW);
        let start = Instant::now();

        assert_eq!(
            limiter.check_at("a", start),
            RateLimitDecision::Admitted { remaining: 0 }
        );
        assert!(!limiter.check_at("a", start).is_admitted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(5, WINDOW));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.admit("same-client") })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
    }
}
