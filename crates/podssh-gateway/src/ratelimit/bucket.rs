//! Token bucket with an adjustable refill rate

use std::time::Duration;
use tokio::time::Instant;

/// A token bucket that hands out reservations.
///
/// The token count may go negative: each reservation takes a token
/// immediately and the caller waits for the deficit to refill, so
/// concurrent callers queue up in reservation order.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens added per second
    rate: f64,
    /// Maximum number of stored tokens
    burst: f64,
    /// Current token count
    tokens: f64,
    /// Last refill time
    updated: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            tokens: burst,
            updated: now,
        }
    }

    /// Current refill rate in events per second
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Change the refill rate, crediting tokens earned at the old rate first
    pub fn set_rate(&mut self, rate: f64, now: Instant) {
        self.refill(now);
        self.rate = rate;
    }

    /// Take one token and return how long the caller must wait for it
    pub fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }

        Duration::try_from_secs_f64(-self.tokens / self.rate).unwrap_or(Duration::MAX)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.updated = now;
    }
}
