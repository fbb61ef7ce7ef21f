use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_UPLOAD_LIMIT: u32 = 10;
pub const DEFAULT_UPLOAD_WINDOW: Duration = Duration::from_secs(60);

/// Admission check for rate-limited operations, keyed by caller identity.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, identifier: &str) -> bool;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn allow(&self, _identifier: &str) -> bool {
        true
    }
}

/// In-process fixed-window limiter: at most `max_requests` per identifier per `window`.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, WindowState>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    count: u32,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn allow_at(&self, identifier: &str, now: Instant) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        windows.retain(|_, state| now.saturating_duration_since(state.started) < self.window);
        let state = windows
            .entry(identifier.to_string())
            .or_insert(WindowState {
                started: now,
                count: 0,
            });
        if state.count >= self.max_requests {
            return false;
        }
        state.count += 1;
        true
    }
}

impl Default for FixedWindowRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_LIMIT, DEFAULT_UPLOAD_WINDOW)
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn allow(&self, identifier: &str) -> bool {
        self.allow_at(identifier, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{FixedWindowRateLimiter, RateLimiter, Unlimited};

    #[test]
    fn blocks_after_limit_within_window() {
        let limiter = FixedWindowRateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.allow_at("guest-1", now));
        assert!(limiter.allow_at("guest-1", now + Duration::from_secs(1)));
        assert!(!limiter.allow_at("guest-1", now + Duration::from_secs(2)));
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = FixedWindowRateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("guest-1"));
        assert!(limiter.allow("guest-2"));
        assert!(!limiter.allow("guest-1"));
    }

    #[test]
    fn window_expiry_restores_budget() {
        let limiter = FixedWindowRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.allow_at("guest-1", now));
        assert!(!limiter.allow_at("guest-1", now + Duration::from_secs(59)));
        assert!(limiter.allow_at("guest-1", now + Duration::from_secs(60)));
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        let limiter = FixedWindowRateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_requests(), 1);
        assert!(Unlimited.allow("anyone"));
    }
}
