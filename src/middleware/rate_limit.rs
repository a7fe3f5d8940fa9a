//! Rate limiting with a fixed window counter.
//!
//! The counter is shared by every connection. When the window has elapsed
//! the counter resets on the next request.

use crate::pipeline::{Middleware, Request, Verdict};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u64,
}

pub struct RateLimitMiddleware {
    max_requests: u64,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimitMiddleware {
    /// Limit to `max_requests` per minute.
    pub fn new(max_requests: u64) -> Self {
        Self::with_window(max_requests, DEFAULT_WINDOW)
    }

    pub fn with_window(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Count a request at `now`, returning whether it is within the limit.
    fn admit(&self, now: Instant) -> bool {
        // a poisoned lock still holds a usable counter
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now.saturating_duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }

        if state.count >= self.max_requests {
            warn!(
                count = state.count,
                max = self.max_requests,
                "Rate limit exceeded"
            );
            return false;
        }

        state.count += 1;
        trace!(count = state.count, max = self.max_requests, "Request allowed");
        true
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn before(&self, _request: &mut Request) -> Verdict {
        if self.admit(Instant::now()) {
            Verdict::Proceed
        } else {
            Verdict::Reject("Rate limit exceeded".to_string())
        }
    }
}
