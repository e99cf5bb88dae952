//! Per-agent token-bucket rate limiting.
//!
//! The orchestrator acquires a token before every invocation, keyed by agent
//! id with the rate and burst from that agent's config.  Acquisition blocks
//! cooperatively until a token is available, the supplied deadline passes, or
//! the cancellation token trips.  A rate of `0` disables gating entirely.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use roundtable::ratelimit::RateLimiter;
//! use tokio::time::Instant;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new();
//! let cancel = CancellationToken::new();
//! let deadline = Instant::now() + Duration::from_secs(1);
//!
//! // Two requests per second with a burst of one.
//! limiter.acquire("critic", 2.0, 1, deadline, &cancel).await.unwrap();
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::roundtable::error::AgentError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by agent id.
///
/// Buckets are created lazily on first acquisition; the rate and burst are
/// supplied per call so the limiter itself stays configuration-free.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire one token for `agent_id`, blocking until one refills or the
    /// deadline/cancellation fires.
    ///
    /// `rate` is tokens per second, `burst` the bucket capacity.  A
    /// non-positive rate always succeeds immediately.  Returns
    /// [`AgentError::RateLimited`] when the deadline passes first and
    /// [`AgentError::Cancelled`] when the token trips first.
    pub async fn acquire(
        &self,
        agent_id: &str,
        rate: f64,
        burst: u32,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        if rate <= 0.0 {
            return Ok(());
        }
        let capacity = f64::from(burst.max(1));
        let mut logged_block = false;

        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets.entry(agent_id.to_string()).or_insert(Bucket {
                    tokens: capacity,
                    last_refill: now,
                });
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / rate)
            };

            if !logged_block {
                log::debug!(
                    "rate limiter: agent '{}' blocked for ~{:?} (rate {}/s, burst {})",
                    agent_id,
                    wait,
                    rate,
                    burst
                );
                logged_block = true;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AgentError::RateLimited(format!(
                    "no token for agent '{}' within the turn window",
                    agent_id
                )));
            }
            let sleep_for = wait.min(deadline.duration_since(now));
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
            if Instant::now() >= deadline {
                return Err(AgentError::RateLimited(format!(
                    "no token for agent '{}' within the turn window",
                    agent_id
                )));
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
