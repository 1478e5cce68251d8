//! Fixed-window request limiter keyed by endpoint class and client identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Purge expired windows once every this many checks.
const PURGE_EVERY: u64 = 1024;

/// Endpoint groups with independent thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Query,
    Stats,
    Reconciliation,
    Admin,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Stats => "stats",
            Self::Reconciliation => "reconciliation",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitRule {
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// No rule for this class
    Unlimited,
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Limited {
        limit: u32,
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per `(class, client)` in fixed windows.
///
/// A window starts with the first request from a client and resets once
/// `rule.window` has elapsed. A rejected request does not consume quota.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    rules: HashMap<EndpointClass, RateLimitRule>,
    windows: DashMap<(EndpointClass, String), Window>,
    checks: AtomicU64,
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new(rules: HashMap<EndpointClass, RateLimitRule>) -> Self {
        Self {
            rules,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn rule(&self, class: EndpointClass) -> Option<RateLimitRule> {
        self.rules.get(&class).copied()
    }

    pub fn check(&self, class: EndpointClass, client: &str) -> RateLimitDecision {
        self.check_at(class, client, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading
    pub fn check_at(&self, class: EndpointClass, client: &str, now: Instant) -> RateLimitDecision {
        let Some(rule) = self.rule(class) else {
            return RateLimitDecision::Unlimited;
        };

        if self.checks.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired(now);
        }

        let mut window = self
            .windows
            .entry((class, client.to_string()))
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if now.saturating_duration_since(window.started) >= rule.window {
            window.started = now;
            window.count = 0;
        }

        let reset_after = rule
            .window
            .saturating_sub(now.saturating_duration_since(window.started));

        if window.count >= rule.max_requests {
            return RateLimitDecision::Limited {
                limit: rule.max_requests,
                retry_after: reset_after,
            };
        }

        window.count += 1;
        RateLimitDecision::Allowed {
            limit: rule.max_requests,
            remaining: rule.max_requests - window.count,
            reset_after,
        }
    }

    /// Drop windows that have fully elapsed
    pub fn purge_expired(&self, now: Instant) {
        self.windows.retain(|(class, _), window| {
            self.rules
                .get(class)
                .is_some_and(|rule| now.saturating_duration_since(window.started) < rule.window)
        });
    }

    /// Number of live windows (for tests and metrics)
    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter::new(HashMap::from([(
            EndpointClass::Reconciliation,
            RateLimitRule::new(max, Duration::from_secs(window_secs)),
        )]))
    }

    #[test]
    fn test_sixth_request_in_window_is_rejected_with_remaining_window() {
        let limiter = limiter(5, 600);
        let t0 = Instant::now();

        for i in 0..5 {
            let decision = limiter.check_at(
                EndpointClass::Reconciliation,
                "1.2.3.4:ua",
                t0 + Duration::from_secs(i * 10),
            );
            assert!(matches!(decision, RateLimitDecision::Allowed { .. }));
        }

        let decision = limiter.check_at(
            EndpointClass::Reconciliation,
            "1.2.3.4:ua",
            t0 + Duration::from_secs(60),
        );
        assert_eq!(
            decision,
            RateLimitDecision::Limited {
                limit: 5,
                retry_after: Duration::from_secs(540),
            }
        );
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = limiter(1, 10);
        let t0 = Instant::now();
        assert!(matches!(
            limiter.check_at(EndpointClass::Reconciliation, "c", t0),
            RateLimitDecision::Allowed { remaining: 0, .. }
        ));
        assert!(matches!(
            limiter.check_at(EndpointClass::Reconciliation, "c", t0 + Duration::from_secs(5)),
            RateLimitDecision::Limited { .. }
        ));
        assert!(matches!(
            limiter.check_at(EndpointClass::Reconciliation, "c", t0 + Duration::from_secs(10)),
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_clients_and_classes_are_independent() {
        let limiter = FixedWindowRateLimiter::new(HashMap::from([
            (
                EndpointClass::Reconciliation,
                RateLimitRule::new(1, Duration::from_secs(60)),
            ),
            (
                EndpointClass::Query,
                RateLimitRule::new(2, Duration::from_secs(60)),
            ),
        ]));
        let now = Instant::now();

        assert!(matches!(
            limiter.check_at(EndpointClass::Reconciliation, "a", now),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at(EndpointClass::Reconciliation, "b", now),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at(EndpointClass::Query, "a", now),
            RateLimitDecision::Allowed { remaining: 1, .. }
        ));
        assert_eq!(
            limiter.check_at(EndpointClass::Stats, "a", now),
            RateLimitDecision::Unlimited
        );
    }

    #[test]
    fn test_purge_drops_expired_windows() {
        let limiter = limiter(5, 10);
        let t0 = Instant::now();
        limiter.check_at(EndpointClass::Reconciliation, "a", t0);
        limiter.check_at(EndpointClass::Reconciliation, "b", t0 + Duration::from_secs(8));
        assert_eq!(limiter.tracked_windows(), 2);

        limiter.purge_expired(t0 + Duration::from_secs(12));
        assert_eq!(limiter.tracked_windows(), 1);
    }
}
