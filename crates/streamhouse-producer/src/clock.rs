//! Time source for the producer.
//!
//! Reads tokio's clock so that tests running with paused time see the same
//! instants as the accumulator and the send loop.

use std::time::{Duration, Instant};

/// Roughly 30 years. Stands in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// `instant + duration`, clamped to a far-future instant instead of
/// panicking when configured delays are huge.
pub(crate) fn saturating_add(instant: Instant, duration: Duration) -> Instant {
    instant
        .checked_add(duration)
        .or_else(|| instant.checked_add(FAR_FUTURE))
        .unwrap_or(instant)
}
