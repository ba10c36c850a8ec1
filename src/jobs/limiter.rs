//! Shared resource limits: per-source token buckets and the SERP permit.
//!
//! The browser SERP lane is a single-slot exclusive resource; academic
//! APIs are token-bucketed per source, shared across workers.

use crate::config::SourceConfig;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `rate_per_minute` refill, `burst` capacity.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate_per_second: rate_per_minute.max(1) as f64 / 60.0,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_second))
                }
            };

            match wait {
                Some(wait) => sleep(wait).await,
                None => return,
            }
        }
    }

    /// Take a token only if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token buckets for every configured academic source, plus a default for
/// sources with no explicit settings.
pub struct SourceLimiters {
    buckets: HashMap<String, TokenBucket>,
    fallback: TokenBucket,
}

impl SourceLimiters {
    pub fn new(sources: &HashMap<String, SourceConfig>) -> Self {
        let buckets = sources
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    TokenBucket::new(config.rate_per_minute, config.burst),
                )
            })
            .collect();
        let default = SourceConfig::default();
        Self {
            buckets,
            fallback: TokenBucket::new(default.rate_per_minute, default.burst),
        }
    }

    pub async fn acquire(&self, source: &str) {
        match self.buckets.get(source) {
            Some(bucket) => bucket.acquire().await,
            None => self.fallback.acquire().await,
        }
    }
}

/// The single-slot browser SERP lane. Holders must release before any
/// suspension point other than the SERP operation itself.
pub fn serp_permit() -> Semaphore {
    Semaphore::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_exhaustion() {
        let bucket = TokenBucket::new(60, 2);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let bucket = TokenBucket::new(60, 1);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);

        // 60/min refills one token per second.
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(60, 1);
        bucket.acquire().await;

        let waited = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            bucket.acquire().await;
            started.elapsed()
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        let elapsed = waited.await.unwrap();
        assert!(elapsed >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_limiters_fall_back_for_unknown_source() {
        let limiters = SourceLimiters::new(&HashMap::new());
        // Default burst admits an immediate acquire without sleeping.
        limiters.acquire("never-configured").await;
    }

    #[tokio::test]
    async fn test_serp_permit_is_single_slot() {
        let permit = serp_permit();
        let held = permit.acquire().await.unwrap();
        assert_eq!(permit.available_permits(), 0);
        drop(held);
        assert_eq!(permit.available_permits(), 1);
    }
}
