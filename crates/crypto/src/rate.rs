//! Per-sender sliding-window rate limiter.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// Limits each sender to `max_events` within a sliding window.
#[derive(Debug)]
pub struct RateLimiter {
    max_events: usize,
    window_ms: u64,
    inner: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window_ms: u64) -> Self {
        Self {
            max_events,
            window_ms,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records an event for the sender. Returns `false` if the sender has
    /// exceeded its budget inside the current window; over-limit events are
    /// not recorded.
    pub fn check_and_record(&self, sender: &str, now_ms: u64) -> bool {
        let mut map = self.inner.lock();
        let events = map.entry(sender.to_owned()).or_default();

        let horizon = now_ms.saturating_sub(self.window_ms);
        while events.front().is_some_and(|ts| *ts < horizon) {
            events.pop_front();
        }

        if events.len() >= self.max_events {
            return false;
        }
        events.push_back(now_ms);
        true
    }
}
