//! Admission control at the channel edge.
//!
//! Raw channel input is screened before it can become a turn: blank input is
//! ignored, oversized queries are rejected, and each client address gets a
//! sliding one-minute request budget.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;
use dashmap::DashMap;
use log::debug;

const WINDOW: Duration = Duration::from_secs(60);

/// Checks between sweeps of idle clients.
const SWEEP_EVERY: usize = 256;

/// Prefix a user-facing message with the local wall-clock time.
pub fn stamped(message: &str) -> String {
    format!("[{}] {message}", Local::now().format("%H:%M:%S"))
}

/// Outcome of screening one raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screened {
    Accept(String),
    Ignore,
    Reject(String),
}

/// Sliding-window request counter per client address.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    requests: DashMap<IpAddr, VecDeque<Instant>>,
    checks: AtomicUsize,
}

impl RateLimiter {
    /// `max_per_minute == 0` disables limiting.
    pub fn new(max_per_minute: usize) -> Self {
        Self::with_window(max_per_minute, WINDOW)
    }

    pub fn with_window(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            requests: DashMap::new(),
            checks: AtomicUsize::new(0),
        }
    }

    /// Record a request from `client` at `now`. Returns `false` when the
    /// budget is exhausted; rejected requests are not recorded.
    pub fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        if self.max_per_window == 0 {
            return true;
        }

        // Sweep before taking the entry: `retain` locks every shard.
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep_at(now);
        }

        let mut entry = self.requests.entry(client).or_default();
        while entry
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
        {
            entry.pop_front();
        }

        if entry.len() >= self.max_per_window {
            debug!("rate limit reached for {client}");
            return false;
        }
        entry.push_back(now);
        true
    }

    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    /// Forget requests that left the window and clients with none left.
    pub fn sweep_at(&self, now: Instant) {
        let before = self.requests.len();
        self.requests.retain(|_, times| {
            while times
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
            {
                times.pop_front();
            }
            !times.is_empty()
        });
        let dropped = before.saturating_sub(self.requests.len());
        if dropped > 0 {
            debug!("rate limiter forgot {dropped} idle client(s)");
        }
    }

    /// Number of clients with requests still in the window.
    pub fn tracked_clients(&self) -> usize {
        self.requests.len()
    }
}

/// Input screening and rate limiting shared by all channels.
#[derive(Debug)]
pub struct Admission {
    limiter: RateLimiter,
    max_query_chars: usize,
}

impl Admission {
    pub fn new(max_requests_per_minute: usize, max_query_chars: usize) -> Self {
        Self {
            limiter: RateLimiter::new(max_requests_per_minute),
            max_query_chars,
        }
    }

    /// No rate limit and no length limit.
    pub fn unlimited() -> Self {
        Self::new(0, usize::MAX)
    }

    /// Classify raw input without touching the rate budget.
    pub fn screen(&self, text: &str) -> Screened {
        if text.trim().is_empty() {
            return Screened::Ignore;
        }
        if text.chars().count() > self.max_query_chars {
            return Screened::Reject(format!(
                "Message too long. Please keep messages under {} characters.",
                self.max_query_chars
            ));
        }
        Screened::Accept(text.to_string())
    }

    /// Spend one unit of `client`'s budget. Returns the rejection message
    /// when the budget is exhausted.
    pub fn admit(&self, client: IpAddr) -> Option<String> {
        if self.limiter.check(client) {
            None
        } else {
            Some(
                "Rate limit exceeded. Please wait a moment before sending more messages."
                    .to_string(),
            )
        }
    }
}
