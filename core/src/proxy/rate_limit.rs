//! Per-client token bucket rate limiting

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Idle buckets older than this are dropped by [`RateLimiter::sweep`].
pub const BUCKET_RETENTION: Duration = Duration::from_secs(120);

/// How often the background sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl RateLimitSettings {
    fn refill_per_second(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(capacity);
            self.last_refill = now;
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed {
        /// Tokens left after this request; `None` when limiting is disabled.
        remaining: Option<f64>,
    },
    Denied {
        retry_after_secs: f64,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub refill_per_second: f64,
    pub active_buckets: usize,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    /// identity -> bucket; DashMap shards give each key an exclusive write lock
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
        }
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    pub fn admit(&self, identity: &str) -> Admission {
        self.admit_at(identity, Instant::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn admit_at(&self, identity: &str, now: Instant) -> Admission {
        if !self.settings.enabled {
            return Admission::Allowed { remaining: None };
        }

        let capacity = self.settings.burst_size as f64;
        let rate = self.settings.refill_per_second();

        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                tracing::debug!("New rate limit bucket for {} (burst {})", identity, self.settings.burst_size);
                TokenBucket::full(capacity, now)
            });

        bucket.refill(capacity, rate, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Admission::Allowed {
                remaining: Some(bucket.tokens),
            }
        } else {
            let retry_after_secs = (1.0 - bucket.tokens) / rate;
            tracing::warn!(
                "Rate limit denied {}: tokens {:.2}/{}, retry after {:.2}s",
                identity,
                bucket.tokens,
                self.settings.burst_size,
                retry_after_secs
            );
            Admission::Denied { retry_after_secs }
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Remove buckets idle for longer than [`BUCKET_RETENTION`].
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            if now.saturating_duration_since(bucket.last_refill) > BUCKET_RETENTION {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Start the periodic sweep. The task runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Rate limit sweeper started (every {:?})", every);
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::info!("Evicted {} idle rate limit bucket(s)", removed);
                }
                tracing::debug!("Active rate limit buckets: {}", limiter.len());
            }
        })
    }

    /// Current token count of a bucket, without refilling it.
    pub fn bucket_tokens(&self, identity: &str) -> Option<f64> {
        self.buckets.get(identity).map(|b| b.tokens)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            enabled: self.settings.enabled,
            requests_per_minute: self.settings.requests_per_minute,
            burst_size: self.settings.burst_size,
            refill_per_second: self.settings.refill_per_second(),
            active_buckets: self.len(),
        }
    }
}
