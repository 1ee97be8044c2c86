//! Per-client sliding-window rate limiting for webhook admission.
//!
//! A request at time `T` is allowed iff fewer than `max_requests` earlier
//! admitted requests from the same client fall within `(T - window, T]`.
//! Denied requests are not recorded.
//!
//! State is purely in memory. A restart forgets every client, which only
//! weakens short-term burst protection.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 30,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    // Oldest timestamp at the front
    windows: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Admit or deny a request from `client_key`, recording it if admitted.
    pub fn is_allowed(&self, client_key: &str) -> bool {
        self.is_allowed_at(client_key, Instant::now())
    }

    fn is_allowed_at(&self, client_key: &str, now: Instant) -> bool {
        let cutoff = now.checked_sub(self.config.window);

        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let timestamps = windows.entry(client_key.to_string()).or_default();
        prune(timestamps, cutoff);

        if timestamps.len() >= self.config.max_requests {
            tracing::warn!(
                client = client_key,
                requests = timestamps.len(),
                max = self.config.max_requests,
                "rate limit exceeded"
            );
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// How many more requests `client_key` may make right now.
    pub fn remaining(&self, client_key: &str) -> usize {
        self.remaining_at(client_key, Instant::now())
    }

    fn remaining_at(&self, client_key: &str, now: Instant) -> usize {
        let cutoff = now.checked_sub(self.config.window);
        let windows = self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let used = windows
            .get(client_key)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|&&t| cutoff.map_or(true, |c| t > c))
                    .count()
            })
            .unwrap_or(0);

        self.config.max_requests.saturating_sub(used)
    }

    /// Drop every client whose whole history has aged out of the window.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let cutoff = now.checked_sub(self.config.window);
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let before = windows.len();
        windows.retain(|_, timestamps| {
            prune(timestamps, cutoff);
            !timestamps.is_empty()
        });
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = windows.len(), "rate limiter cleanup");
        }
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else {
        return;
    };
    while timestamps.front().is_some_and(|&t| t <= cutoff) {
        timestamps.pop_front();
    }
}
