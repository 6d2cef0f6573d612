//! Producer instrumentation.
//!
//! The send loop reports what it does through a [`MetricsSink`]. Reporting is
//! fire-and-forget: nothing a sink does feeds back into batching or delivery.
//! Every producer also keeps its own [`ProducerStats`] counters, readable
//! through `Producer::stats()`, so a sink is only needed to export to an
//! external system.

use crate::cluster::TopicPartition;
use crate::error::ProducerError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives producer events. All methods default to no-ops.
pub trait MetricsSink: Send + Sync {
    /// A record was accepted into a batch.
    fn record_appended(&self, _topic_partition: &TopicPartition, _bytes: usize) {}

    /// A batch left the accumulator after waiting `queue_time`.
    fn batch_drained(
        &self,
        _topic_partition: &TopicPartition,
        _records: u32,
        _bytes: usize,
        _queue_time: Duration,
    ) {
    }

    /// A batch failed retriably and was put back at the head of its queue.
    fn batch_retried(&self, _topic_partition: &TopicPartition, _attempts: u32) {}

    /// A batch reached its terminal outcome.
    fn batch_completed(
        &self,
        _topic_partition: &TopicPartition,
        _records: u32,
        _error: Option<&ProducerError>,
    ) {
    }

    /// Buffer pool gauges, sampled once per send-loop iteration.
    fn buffer_state(&self, _available: usize, _total: usize, _queued_waiters: usize) {}
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Cumulative counters kept by every producer.
#[derive(Debug, Default)]
pub struct ProducerStats {
    records_appended: AtomicU64,
    records_delivered: AtomicU64,
    records_failed: AtomicU64,
    batches_sent: AtomicU64,
    batches_expired: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    buffer_available: AtomicU64,
    waiters: AtomicU64,
}

impl ProducerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            records_appended: self.records_appended.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_expired: self.batches_expired.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            buffer_available: self.buffer_available.load(Ordering::Relaxed),
            waiters: self.waiters.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for ProducerStats {
    fn record_appended(&self, _topic_partition: &TopicPartition, _bytes: usize) {
        self.records_appended.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_drained(&self, _: &TopicPartition, _: u32, _: usize, _: Duration) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_retried(&self, _topic_partition: &TopicPartition, _attempts: u32) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_completed(
        &self,
        _topic_partition: &TopicPartition,
        records: u32,
        error: Option<&ProducerError>,
    ) {
        match error {
            None => {
                self.records_delivered
                    .fetch_add(u64::from(records), Ordering::Relaxed);
            }
            Some(err) => {
                self.records_failed
                    .fetch_add(u64::from(records), Ordering::Relaxed);
                self.errors.fetch_add(1, Ordering::Relaxed);
                if matches!(err, ProducerError::BatchExpired(_)) {
                    self.batches_expired.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn buffer_state(&self, available: usize, _total: usize, queued_waiters: usize) {
        self.buffer_available
            .store(available as u64, Ordering::Relaxed);
        self.waiters.store(queued_waiters as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`ProducerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStatsSnapshot {
    /// Records accepted by `send`
    pub records_appended: u64,
    /// Records whose batch succeeded
    pub records_delivered: u64,
    /// Records whose batch failed terminally
    pub records_failed: u64,
    /// Batches drained into requests, retries included
    pub batches_sent: u64,
    pub batches_expired: u64,
    /// Batches re-enqueued after a retriable failure
    pub retries: u64,
    /// Batches that failed terminally
    pub errors: u64,
    /// Last sampled free buffer memory
    pub buffer_available: u64,
    /// Last sampled number of blocked allocators
    pub waiters: u64,
}

impl ProducerStatsSnapshot {
    /// Fraction of finished records that were delivered.
    pub fn success_rate(&self) -> f64 {
        let finished = self.records_delivered + self.records_failed;
        if finished == 0 {
            1.0
        } else {
            self.records_delivered as f64 / finished as f64
        }
    }

    /// Records accepted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.records_appended
            .saturating_sub(self.records_delivered + self.records_failed)
    }
}

/// Forwards every event to the producer's own stats and to the user sink.
pub(crate) struct Instruments {
    pub(crate) stats: Arc<ProducerStats>,
    pub(crate) sink: Arc<dyn MetricsSink>,
}

impl Instruments {
    pub(crate) fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            stats: Arc::new(ProducerStats::new()),
            sink,
        }
    }
}

impl MetricsSink for Instruments {
    fn record_appended(&self, tp: &TopicPartition, bytes: usize) {
        self.stats.record_appended(tp, bytes);
        self.sink.record_appended(tp, bytes);
    }

    fn batch_drained(&self, tp: &TopicPartition, records: u32, bytes: usize, queue_time: Duration) {
        self.stats.batch_drained(tp, records, bytes, queue_time);
        self.sink.batch_drained(tp, records, bytes, queue_time);
    }

    fn batch_retried(&self, tp: &TopicPartition, attempts: u32) {
        self.stats.batch_retried(tp, attempts);
        self.sink.batch_retried(tp, attempts);
    }

    fn batch_completed(&self, tp: &TopicPartition, records: u32, error: Option<&ProducerError>) {
        self.stats.batch_completed(tp, records, error);
        self.sink.batch_completed(tp, records, error);
    }

    fn buffer_state(&self, available: usize, total: usize, queued_waiters: usize) {
        self.stats.buffer_state(available, total, queued_waiters);
        self.sink.buffer_state(available, total, queued_waiters);
    }
}
