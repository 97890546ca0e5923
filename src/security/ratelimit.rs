use crate::error::SecurityError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Token bucket for one client
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// Tokens per second
    rate: f64,
    max_tokens: f64,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
            rate,
            max_tokens: burst as f64,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
    }
}

/// Per-client request limiter: `max_requests` per `window`, refilled smoothly
pub struct RateLimiter {
    max_requests: u32,
    rate: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let window_secs = window.as_secs_f64().max(f64::EPSILON);
        Self {
            max_requests,
            rate: max_requests as f64 / window_secs,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one request for `client_id`
    pub fn check(&self, client_id: &str) -> Result<(), SecurityError> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.rate, self.max_requests));

        if bucket.try_consume() {
            Ok(())
        } else {
            let wait = bucket.time_until_available();
            Err(SecurityError::RateLimited {
                retry_after_secs: wait.as_secs_f64().ceil().max(1.0) as u64,
            })
        }
    }

    /// Forget a disconnected client
    pub fn remove(&self, client_id: &str) {
        self.buckets.lock().remove(client_id);
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }
}
