//! Retry and expiry decisions for batches.
//!
//! Both policies are stateless: the send loop asks [`RetryPolicy`] what to do
//! with a batch that failed, and the accumulator asks [`ExpiryPolicy`] whether
//! a batch that never made it out has waited too long.
//!
//! ## Retry Flow
//!
//! ```text
//! ┌──────────────┐   error    ┌──────────────────────────────┐
//! │ ProduceResp  │ ─────────▶ │  RetryPolicy::can_retry      │
//! └──────────────┘            │  - attempts < max_retries    │
//!                             │  - error.is_retriable()      │
//!                             └──────┬───────────────┬───────┘
//!                                yes │               │ no
//!                                    ▼               ▼
//!                     reenqueue at queue head    complete(Err)
//!                     retry_at = now + backoff
//!
//!  Attempt 1 retry: wait 100ms (backoff)
//!  Attempt 2 retry: wait 200ms (backoff * 2)
//!  Attempt 3 retry: wait 400ms (backoff * 4)
//! ```
//!
//! Backoff is fixed when the batch is re-enqueued, so a batch never moves
//! earlier or later in the queue's schedule while it waits.
//!
//! ## Expiry
//!
//! Two independent triggers, either one is enough:
//!
//! - a **full** batch whose last append is older than `full_batch_timeout`
//! - any batch whose last attempt (its creation, if never sent) plus linger is
//!   older than `unsent_batch_timeout`
//!
//! Batches being retried are never expired here; their fate is decided by
//! the retry path.

use crate::clock;
use crate::error::ProducerError;
use std::time::{Duration, Instant};

/// Retry policy configuration for exponential backoff.
///
/// # Fields
///
/// * `max_retries` - How many times a batch may be resent (default: 3)
/// * `initial_backoff` - Backoff before the first resend (default: 100ms)
/// * `max_backoff` - Upper bound on any backoff (default: 1s)
/// * `backoff_multiplier` - Growth factor between attempts (default: 2.0)
/// * `jitter` - Spread each backoff by ±25% (default: false)
///
/// # Backoff Calculation
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
///
/// # Examples
///
/// ```ignore
/// // Aggressive retries (low latency)
/// let policy = RetryPolicy {
///     max_retries: 10,
///     initial_backoff: Duration::from_millis(10),
///     max_backoff: Duration::from_secs(1),
///     backoff_multiplier: 1.5,
///     jitter: true,
/// };
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of resends per batch
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,

    /// Randomize backoff to avoid synchronized retries
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for a given attempt number.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Attempt number (0-indexed)
    ///
    /// # Returns
    ///
    /// Backoff duration = min(initial_backoff * multiplier^attempt, max_backoff)
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(0), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(1), Duration::from_millis(200));
    /// assert_eq!(policy.backoff(2), Duration::from_millis(400));
    /// ```
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Backoff to apply to a batch that has now been attempted `attempts` times.
    ///
    /// With jitter enabled the result is scaled by a random factor in
    /// `[0.75, 1.25)`.
    pub fn retry_backoff_for(&self, attempts: u32) -> Duration {
        let base = self.backoff(attempts.saturating_sub(1));
        if !self.jitter {
            return base;
        }
        let jitter = 0.75 + (rand::random::<f64>() * 0.5); // 0.75-1.25x
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }

    /// Whether a batch that has been retried `attempts` times may be retried again
    /// after failing with `error`.
    pub fn can_retry(&self, attempts: u32, error: &ProducerError) -> bool {
        attempts < self.max_retries && error.is_retriable()
    }
}

/// When a batch that is stuck in the accumulator should be failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// How long a full batch may wait after its last append
    pub full_batch_timeout: Duration,

    /// How long any batch may wait past its last attempt plus linger
    pub unsent_batch_timeout: Duration,
}

impl ExpiryPolicy {
    /// Both windows set to the same timeout.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            full_batch_timeout: timeout,
            unsent_batch_timeout: timeout,
        }
    }

    /// Evaluate both triggers for a batch.
    ///
    /// # Arguments
    ///
    /// * `full` - The batch can take no more records
    /// * `last_append` - Time of the most recent append
    /// * `last_attempt` - Time of the most recent send attempt, or creation
    /// * `linger` - Configured linger delay
    /// * `now` - Current time
    pub fn is_expired(
        &self,
        full: bool,
        last_append: Instant,
        last_attempt: Instant,
        linger: Duration,
        now: Instant,
    ) -> bool {
        let stale_full =
            full && now.saturating_duration_since(last_append) > self.full_batch_timeout;
        let stale_unsent =
            now.saturating_duration_since(clock::saturating_add(last_attempt, linger))
                > self.unsent_batch_timeout;
        stale_full || stale_unsent
    }
}
