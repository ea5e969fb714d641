//! Client-side request limiter
//!
//! One token bucket per remote action, checked before every attempt. The
//! engine spaces its own calls instead of relying on provider throttling.

use crate::deadline::{Deadline, Interrupt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tolerance for float drift after a refill wait
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per second allowed for each action
    pub requests_per_second: u32,
    /// Per-action overrides, keyed like `mongodb_instance.read`
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub action_limits: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 20,
            action_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_action_limit(mut self, action: &str, requests_per_second: u32) -> Self {
        self.action_limits.insert(action.to_string(), requests_per_second);
        self
    }

    pub fn limit_for(&self, action: &str) -> u32 {
        self.action_limits
            .get(action)
            .copied()
            .unwrap_or(self.requests_per_second)
            .max(1)
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_second: u32) -> Self {
        Self {
            tokens: f64::from(tokens_per_second),
            max_tokens: f64::from(tokens_per_second),
            refill_rate: f64::from(tokens_per_second),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let refilled = self.tokens + elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = refilled.min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take a token, or return how long until one is available
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            let wait_ms = ((1.0 - self.tokens) / self.refill_rate * 1_000.0).ceil();
            Err(Duration::from_millis(wait_ms as u64))
        }
    }
}

/// Per-action token buckets, shared by every clone of a [`super::Retrier`]
#[derive(Debug)]
pub struct ActionLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl ActionLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until `action` may issue one request, or until `deadline` interrupts
    pub async fn acquire(&self, action: &str, deadline: &Deadline) -> Result<(), Interrupt> {
        if !self.config.enabled {
            return Ok(());
        }
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets
                    .entry(action.to_string())
                    .or_insert_with(|| TokenBucket::new(self.config.limit_for(action)));
                match bucket.try_acquire() {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };
            tracing::trace!("{}: local rate limit reached, waiting {:?}", action, wait);
            deadline.sleep(wait).await?;
        }
    }
}
