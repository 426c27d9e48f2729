//! Token-bucket rate limiting with jittered exponential backoff.
//!
//! Each external channel gets its own bucket with a fixed capacity and refill
//! rate. Every invocation attempt takes one token. When a bucket is empty the
//! caller backs off (`base * 2^attempt`, capped at `max_delay`, ±25% jitter)
//! until a token frees up or the total wait passes `max_wait`, at which point
//! the attempt is reported as a transient failure.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Fraction of the nominal delay applied as random jitter in either direction.
pub const JITTER_FRACTION: f64 = 0.25;

/// Limiter settings, shared by every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_capacity() -> u32 {
    4
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_wait_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_wait: Duration::from_millis(self.max_wait_ms),
        }
    }
}

/// Exponential backoff with jitter, bounded by a total wait ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_wait: Duration,
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max_delay)` before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(30));
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Nominal delay with ±25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64((nominal * (1.0 + jitter)).max(0.0))
    }
}

/// A fixed-capacity bucket refilled at a fixed rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Rate limit for channel '{channel}' not cleared after waiting {waited:?}")]
pub struct RateLimited {
    pub channel: String,
    pub waited: Duration,
}

/// Per-channel token buckets.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    backoff: BackoffPolicy,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let backoff = config.backoff();
        Self {
            config,
            backoff,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    async fn try_take(&self, channel: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(channel.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.capacity, self.config.refill_per_sec))
            .try_acquire()
    }

    /// Wait for a token on `channel`, backing off while the bucket is empty.
    pub async fn acquire(&self, channel: &str) -> Result<(), RateLimited> {
        let mut waited = Duration::ZERO;
        let mut attempt = 0u32;
        loop {
            if self.try_take(channel).await {
                return Ok(());
            }
            let delay = self.backoff.delay(attempt);
            if waited + delay > self.backoff.max_wait {
                return Err(RateLimited {
                    channel: channel.to_string(),
                    waited,
                });
            }
            debug!(channel, attempt, delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(delay).await;
            waited += delay;
            attempt += 1;
        }
    }
}
