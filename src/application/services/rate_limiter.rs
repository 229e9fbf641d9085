//! Sliding Window Rate Limiter
//!
//! Keyed in-memory admission control. Each key owns a bucket of the
//! timestamps it was admitted at; a request is admitted while fewer than
//! `limit` of them fall inside the trailing window.
//!
//! Independent instances are created per concern (per-user messages,
//! administrative endpoints, public endpoints by client address), so
//! exhausting one never affects another.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitSettings;
use crate::infrastructure::metrics;
use crate::shared::background::PeriodicTask;

// ============================================================================
// Configuration
// ============================================================================

/// Limit and window of one limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub limit: usize,
    /// Trailing window length
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// Outcome of a [`SlidingWindowLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Maximum requests allowed in the window
    pub limit: usize,
    /// Requests still available in the current window
    pub remaining: usize,
    /// Whole seconds until another request would be admitted, zero when
    /// the request was admitted
    pub retry_after: u64,
}

// ============================================================================
// Limiter
// ============================================================================

pub struct SlidingWindowLimiter {
    name: &'static str,
    config: RateLimitConfig,
    buckets: DashMap<String, VecDeque<Instant>>,
    cleanup: Mutex<Option<PeriodicTask>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter without a cleanup task.
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            config,
            buckets: DashMap::new(),
            cleanup: Mutex::new(None),
        }
    }

    /// Create a limiter and start its periodic bucket cleanup.
    pub fn start(name: &'static str, config: RateLimitConfig, cleanup_interval: Duration) -> Arc<Self> {
        let limiter = Arc::new(Self::new(name, config));

        let weak: Weak<Self> = Arc::downgrade(&limiter);
        let task = PeriodicTask::spawn(name, cleanup_interval, move || {
            if let Some(limiter) = weak.upgrade() {
                let removed = limiter.cleanup();
                if removed > 0 {
                    tracing::debug!(limiter = limiter.name, removed, "Evicted idle rate limit buckets");
                }
            }
        });
        *limiter.cleanup.lock() = Some(task);

        tracing::info!(
            limiter = name,
            limit = config.limit,
            window_secs = config.window.as_secs(),
            "Rate limiter started"
        );
        limiter
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Admit or reject one request for `key`.
    ///
    /// Only admitted requests are recorded, so a client hammering a closed
    /// window does not extend its own lockout.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    /// Like [`allow`](Self::allow) but reports remaining capacity or the
    /// retry delay, computed under the same bucket lock as the decision.
    pub fn check(&self, key: &str) -> Result<RateLimitInfo, RateLimitInfo> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_default();
        evict_expired(&mut bucket, now, self.config.window);

        if bucket.len() < self.config.limit {
            bucket.push_back(now);
            Ok(RateLimitInfo {
                limit: self.config.limit,
                remaining: self.config.limit - bucket.len(),
                retry_after: 0,
            })
        } else {
            let retry = retry_after_for(&bucket, now, self.config.window);
            drop(bucket);
            metrics::record_rate_limit_rejection(self.name);
            Err(RateLimitInfo {
                limit: self.config.limit,
                remaining: 0,
                retry_after: retry.as_secs(),
            })
        }
    }

    /// Time until the oldest entry in the window expires, rounded up to
    /// whole seconds. Never less than one second.
    pub fn retry_after(&self, key: &str) -> Duration {
        let now = Instant::now();
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                evict_expired(&mut bucket, now, self.config.window);
                retry_after_for(&bucket, now, self.config.window)
            }
            None => Duration::from_secs(1),
        }
    }

    /// Drop buckets with no entry inside the window. Returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            evict_expired(bucket, now, window);
            !bucket.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Stop the cleanup task. Safe to call any number of times.
    pub async fn stop(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!(limiter = self.name, "Rate limiter stopped");
        }
    }
}

/// The independent limiter instances used by the service.
#[derive(Clone)]
pub struct RateLimiters {
    /// Inbound chat messages, keyed by user id
    pub messages: Arc<SlidingWindowLimiter>,
    /// Administrative endpoints and actions, keyed by admin user id
    pub admin: Arc<SlidingWindowLimiter>,
    /// Public endpoints, keyed by client address
    pub public: Arc<SlidingWindowLimiter>,
}

impl RateLimiters {
    /// Build and start every limiter from settings.
    pub fn start(settings: &RateLimitSettings) -> Self {
        let cleanup = settings.cleanup_interval();
        Self {
            messages: SlidingWindowLimiter::start(
                "messages",
                RateLimitConfig::new(settings.message_limit, Duration::from_secs(settings.message_window_secs)),
                cleanup,
            ),
            admin: SlidingWindowLimiter::start(
                "admin",
                RateLimitConfig::new(settings.admin_limit, Duration::from_secs(settings.admin_window_secs)),
                cleanup,
            ),
            public: SlidingWindowLimiter::start(
                "public",
                RateLimitConfig::new(settings.public_limit, Duration::from_secs(settings.public_window_secs)),
                cleanup,
            ),
        }
    }

    pub async fn stop(&self) {
        self.messages.stop().await;
        self.admin.stop().await;
        self.public.stop().await;
    }
}

fn evict_expired(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = bucket.front() {
        if now.saturating_duration_since(*oldest) >= window {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

fn retry_after_for(bucket: &VecDeque<Instant>, now: Instant, window: Duration) -> Duration {
    let remaining = bucket
        .front()
        .map(|oldest| (*oldest + window).saturating_duration_since(now))
        .unwrap_or_default();
    round_up_to_secs(remaining)
}

/// Round up to whole seconds with a floor of one second.
pub fn round_up_to_secs(d: Duration) -> Duration {
    let mut secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs += 1;
    }
    Duration::from_secs(secs.max(1))
}

// ============================================================================
// Tests
// ============================================================================
