//! Token bucket throttling outbound provider calls.
//!
//! The bucket state sits behind a single `std::sync::Mutex` that is held only
//! for the refill-and-take arithmetic, never across an await point.

use crate::config::override_from_env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Burst size.
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // KIS allows 20 calls/s on real accounts; stay a little under.
        Self {
            capacity: 15,
            refill_per_sec: 15.0,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();
        override_from_env(&mut out.capacity, "RATE_LIMIT_CAPACITY");
        override_from_env(&mut out.refill_per_sec, "RATE_LIMIT_PER_SEC");
        out.capacity = out.capacity.max(1);
        if !(out.refill_per_sec.is_finite() && out.refill_per_sec > 0.0) {
            out.refill_per_sec = Self::default().refill_per_sec;
        }
        out
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

pub type SharedRateLimiter = Arc<TokenBucket>;

impl TokenBucket {
    /// Starts full. A non-positive refill rate falls back to the default.
    pub fn new(name: impl Into<String>, config: &RateLimitConfig) -> Self {
        let name = name.into();
        let capacity = config.capacity.max(1) as f64;
        let refill_per_sec = if config.refill_per_sec.is_finite() && config.refill_per_sec > 0.0 {
            config.refill_per_sec
        } else {
            tracing::warn!(
                limiter = %name,
                refill_per_sec = config.refill_per_sec,
                "invalid refill rate; using default"
            );
            RateLimitConfig::default().refill_per_sec
        };
        Self {
            name,
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn shared(name: impl Into<String>, config: &RateLimitConfig) -> SharedRateLimiter {
        Arc::new(Self::new(name, config))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Takes `n` tokens if available. Otherwise returns how long until enough
    /// would have accumulated (assuming no competing callers).
    pub fn try_acquire(&self, n: u32) -> Result<(), Duration> {
        let need = n as f64;
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state, Instant::now());

        if state.tokens >= need {
            state.tokens -= need;
            return Ok(());
        }

        let deficit = need - state.tokens;
        Err(Duration::try_from_secs_f64(deficit / self.refill_per_sec).unwrap_or(Duration::MAX))
    }

    /// Waits for `n` tokens for at most `timeout`. Returns `false` on timeout
    /// (or when `n` exceeds the bucket capacity); callers treat that as a soft
    /// skip.
    pub async fn acquire(&self, n: u32, timeout: Duration) -> bool {
        if n as f64 > self.capacity {
            tracing::warn!(
                limiter = %self.name,
                requested = n,
                capacity = self.capacity,
                "token request exceeds bucket capacity"
            );
            return false;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let wait = match self.try_acquire(n) {
                Ok(()) => return true,
                Err(wait) => wait,
            };

            let now = Instant::now();
            if now + wait > deadline {
                debug!(
                    limiter = %self.name,
                    requested = n,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit wait exceeds timeout; giving up"
                );
                return false;
            }

            debug!(
                limiter = %self.name,
                requested = n,
                wait_ms = wait.as_millis() as u64,
                "rate limited, waiting for tokens"
            );
            // Sub-millisecond waits would spin.
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: u32, rate: f64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            refill_per_sec: rate,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_rate_still_yields_a_finite_wait() {
        let bucket = TokenBucket::new("test", &config(1, 0.0));
        assert!(bucket.try_acquire(1).is_ok());
        let wait = bucket.try_acquire(1).unwrap_err();
        assert!(wait <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let bucket = TokenBucket::new("test", &config(2, 1.0));
        assert!(bucket.try_acquire(1).is_ok());
        assert!(bucket.try_acquire(1).is_ok());
        let wait = bucket.try_acquire(1).unwrap_err();
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_requests_respect_refill_rate() {
        let capacity = 5;
        let rate = 10.0;
        let n = 25;
        let bucket = TokenBucket::new("test", &config(capacity, rate));

        let start = Instant::now();
        for _ in 0..n {
            assert!(bucket.acquire(1, Duration::from_secs(60)).await);
        }
        let elapsed = start.elapsed().as_secs_f64();
        let floor = (n - capacity) as f64 / rate;
        assert!(elapsed >= floor - 1e-6, "elapsed {elapsed}s < {floor}s");
        // And not absurdly slower.
        assert!(elapsed < floor + 0.5, "elapsed {elapsed}s");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_without_taking_tokens() {
        let bucket = TokenBucket::new("test", &config(1, 0.5));
        assert!(bucket.acquire(1, Duration::from_millis(10)).await);

        let start = Instant::now();
        assert!(!bucket.acquire(1, Duration::from_millis(100)).await);
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(bucket.available() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_token_requests_and_capacity_guard() {
        let bucket = TokenBucket::new("test", &config(3, 3.0));
        assert!(bucket.acquire(3, Duration::from_millis(1)).await);
        // Needs a full second of refill.
        assert!(bucket.acquire(3, Duration::from_secs(2)).await);
        assert!(!bucket.acquire(4, Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let bucket = TokenBucket::new("test", &config(4, 100.0));
        assert!(bucket.try_acquire(4).is_ok());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((bucket.available() - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_bucket() {
        let bucket = TokenBucket::shared("test", &config(2, 4.0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let bucket = Arc::clone(&bucket);
            handles.push(tokio::spawn(async move {
                bucket.acquire(1, Duration::from_secs(30)).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        // 8 tokens beyond the burst at 4/s.
        assert!(start.elapsed().as_secs_f64() >= 2.0 - 1e-6);
    }
}
