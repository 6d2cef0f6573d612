//! Producer API for sending records to StreamHouse.
//!
//! The [`Producer`] is the public face of the delivery engine. `send` picks a
//! partition, appends the record to the accumulator and returns immediately
//! with a [`RecordFuture`]; a background [`Sender`] task batches and delivers.
//!
//! ## Features
//!
//! - **Partition routing**: explicit partition, SipHash of the key, or round robin
//! - **Bounded memory**: `send` waits up to `max_block_ms` when the buffer is full
//! - **Per-record outcomes**: a future and an optional callback per record
//! - **Graceful and forced shutdown**: `close(true)` drains, `close(false)` aborts
//! - **Builder pattern**: fluent configuration, collaborators injected
//!
//! ## Partition Routing
//!
//! 1. **Explicit**: `ProducerRecord::with_partition(p)` sends to `p`. When the
//!    topic is known, `p` must be in range.
//! 2. **Key-based**: the key is hashed with SipHash; the same key always maps
//!    to the same partition for a given partition count.
//! 3. **Round robin**: records without key or partition rotate over the
//!    topic's partitions.
//!
//! ## Examples
//!
//! ### Basic Usage
//!
//! ```ignore
//! use streamhouse_producer::{Producer, ProducerRecord, StaticMetadata};
//! use std::sync::Arc;
//!
//! let producer = Producer::builder()
//!     .metadata(Arc::new(StaticMetadata::new(cluster)))
//!     .transport(my_transport)
//!     .linger(Duration::from_millis(5))
//!     .build()?;
//!
//! let pending = producer
//!     .send(ProducerRecord::new("orders", "order data").with_key("user123"), None)
//!     .await?;
//!
//! let metadata = pending.await?;
//! println!("Written to {} at offset {:?}", metadata.topic_partition, metadata.offset);
//!
//! producer.close(true).await?;
//! ```
//!
//! ### Callbacks
//!
//! ```ignore
//! producer
//!     .send(
//!         ProducerRecord::new("logs", "log line"),
//!         Some(Box::new(|result| {
//!             if let Err(e) = result {
//!                 eprintln!("delivery failed: {}", e);
//!             }
//!         })),
//!     )
//!     .await?;
//! ```

use crate::accumulator::RecordAccumulator;
use crate::batch::{Callback, RecordFuture, RecordMetadata};
use crate::cluster::{MetadataProvider, TopicPartition};
use crate::config::{Acks, ProducerConfig};
use crate::error::{ProducerError, Result};
use crate::metrics::{Instruments, MetricsSink, NoopMetrics, ProducerStatsSnapshot};
use crate::records::record_size;
use crate::sender::{Sender, SenderControl, SenderState};
use crate::transport::Transport;
use bytes::Bytes;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A record to be sent to StreamHouse.
///
/// ## Fields
///
/// - `topic`: Destination topic name
/// - `key`: Optional partitioning key
/// - `value`: Record payload
/// - `partition`: Optional explicit partition (overrides key-based routing)
///
/// ## Examples
///
/// ```ignore
/// // With key (recommended)
/// let record = ProducerRecord::new("orders", "order data").with_key("user123");
///
/// // Explicit partition
/// let record = ProducerRecord::new("logs", "log message").with_partition(2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    /// Topic name to send the record to.
    pub topic: String,

    /// Optional key for partitioning.
    ///
    /// Hashed with SipHash to select a partition when no explicit partition
    /// is given.
    pub key: Option<Bytes>,

    /// Record value (payload).
    pub value: Bytes,

    /// Optional explicit partition ID.
    pub partition: Option<u32>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            partition: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }
}

struct ProducerInner {
    config: ProducerConfig,
    accumulator: Arc<RecordAccumulator>,
    metadata: Arc<dyn MetadataProvider>,
    control: Arc<SenderControl>,
    instruments: Arc<Instruments>,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
    round_robin: AtomicU32,
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        // Let the send loop deliver what is left and exit.
        self.accumulator.close();
        self.control.initiate_close();
    }
}

/// High-level producer for sending records to StreamHouse.
///
/// Cheap to clone; all clones share one accumulator and one send loop.
///
/// ## Thread Safety
///
/// `Producer` is `Send + Sync`. Any number of tasks may call `send`
/// concurrently; records for different partitions never contend.
///
/// ## Lifecycle
///
/// 1. **Build**: `Producer::builder()...build()` spawns the send loop
/// 2. **Send**: `send()` appends records and returns per-record futures
/// 3. **Flush**: `flush()` waits for everything sent so far
/// 4. **Close**: `close(true)` drains and stops the send loop
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Create a new `ProducerBuilder` for configuring a Producer.
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    /// Send a record.
    ///
    /// Returns once the record is buffered. The returned future resolves
    /// when the record's batch is acknowledged or fails for good; `callback`,
    /// if given, is invoked with the same outcome just before.
    ///
    /// # Arguments
    ///
    /// * `record` - The record to send
    /// * `callback` - Optional completion hook, invoked exactly once
    ///
    /// # Errors
    ///
    /// - `RecordTooLarge`: the framed record exceeds `max_request_size` or `buffer_memory`
    /// - `InvalidPartition`: explicit partition out of range
    /// - `TopicNotFound`: no partition given and the topic is unknown
    /// - `BufferExhausted`: no buffer memory freed up within `max_block_ms`
    /// - `Closed`: the producer is closed
    pub async fn send(
        &self,
        record: ProducerRecord,
        callback: Option<Callback>,
    ) -> Result<RecordFuture> {
        let inner = &self.inner;
        if inner.accumulator.is_closed() {
            return Err(ProducerError::Closed);
        }

        let key = record.key.as_deref();
        let size = record_size(key, &record.value);
        let max = inner.config.max_record_size();
        if size > max {
            return Err(ProducerError::RecordTooLarge(size, max));
        }

        let partition = self.partition_for(&record)?;
        let tp = TopicPartition::new(record.topic.clone(), partition);

        let result = inner
            .accumulator
            .append(&tp, key, &record.value, callback, inner.config.max_block())
            .await?;
        inner.instruments.record_appended(&tp, size);

        if result.batch_is_full || result.new_batch_created {
            trace!(
                topic = %tp.topic(),
                partition = tp.partition(),
                full = result.batch_is_full,
                "Waking send loop"
            );
            inner.control.wakeup();
        }

        Ok(result.future)
    }

    /// Send a record and wait for its outcome.
    pub async fn send_and_wait(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        self.send(record, None).await?.await
    }

    /// Wait until every record sent before this call has completed.
    ///
    /// All queued batches are treated as ready while the flush is in
    /// progress, so linger does not delay it. Records are complete when they
    /// succeeded or failed; check the futures or callbacks for the outcome.
    pub async fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.control.state() == SenderState::Closed {
            return Ok(());
        }
        debug!(pending = inner.accumulator.incomplete_count(), "Flushing producer");
        inner.accumulator.begin_flush();
        inner.control.wakeup();
        inner.accumulator.await_flush_completion().await;
        Ok(())
    }

    /// Close the producer.
    ///
    /// With `graceful = true`, queued and in-flight records are delivered
    /// first. With `graceful = false`, every incomplete record fails with
    /// `ForcedClose`. Either way, no record is left without an outcome.
    /// Calling `close` again is a no-op.
    ///
    /// A forced close issued while a graceful close is still draining takes
    /// effect immediately, and both calls return once the loop has stopped.
    pub async fn close(&self, graceful: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.control.state() != SenderState::Closed {
            info!(graceful, "Closing producer");
        }
        inner.accumulator.close();
        if graceful {
            inner.control.initiate_close();
        } else {
            inner.control.force_close();
        }
        inner.control.wait_closed().await;
        self.join_sender().await
    }

    /// Close gracefully, forcing the close if draining takes longer than `timeout`.
    pub async fn close_timeout(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.control.state() != SenderState::Closed {
            info!(timeout_ms = timeout.as_millis() as u64, "Closing producer");
        }
        inner.accumulator.close();
        inner.control.initiate_close();

        if tokio::time::timeout(timeout, inner.control.wait_closed()).await.is_err() {
            warn!(
                pending = inner.accumulator.incomplete_count(),
                "Graceful close timed out, aborting remaining records"
            );
            inner.control.force_close();
            inner.control.wait_closed().await;
        }
        self.join_sender().await
    }

    /// Reap the stopped send loop. Only the first caller sees its outcome.
    async fn join_sender(&self) -> Result<()> {
        let join = self.inner.sender_handle.lock().take();
        let Some(join) = join else {
            return Ok(());
        };
        join.await
            .map_err(|e| ProducerError::Internal(format!("send loop failed: {}", e)))
    }

    fn partition_for(&self, record: &ProducerRecord) -> Result<u32> {
        let cluster = self.inner.metadata.fetch();
        let count = cluster.partition_count(&record.topic).unwrap_or(0);

        if let Some(partition) = record.partition {
            if count > 0 && partition >= count {
                return Err(ProducerError::InvalidPartition(
                    partition,
                    record.topic.clone(),
                    count - 1,
                ));
            }
            return Ok(partition);
        }

        if count == 0 {
            return Err(ProducerError::TopicNotFound(record.topic.clone()));
        }

        Ok(match record.key.as_deref() {
            Some(key) => partition_for_key(key, count),
            None => self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        })
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.inner.instruments.stats.snapshot()
    }

    pub fn buffer_total_bytes(&self) -> usize {
        self.inner.accumulator.pool().total_memory()
    }

    pub fn buffer_available_bytes(&self) -> usize {
        self.inner.accumulator.pool().available_memory()
    }

    /// Callers blocked waiting for buffer memory.
    pub fn queued_waiters(&self) -> usize {
        self.inner.accumulator.pool().queued()
    }

    /// Batches created and not yet completed.
    pub fn pending_batches(&self) -> usize {
        self.inner.accumulator.incomplete_count()
    }

    pub fn sender_state(&self) -> SenderState {
        self.inner.control.state()
    }
}

/// Map a key to a partition with SipHash.
///
/// Same key and partition count always give the same partition.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> u32 {
    let mut hasher = siphasher::sip::SipHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partition_count)) as u32
}

/// Builder for creating a [`Producer`] with custom configuration.
///
/// ## Required
///
/// - `metadata`: source of partition leadership
/// - `transport`: network client used by the send loop
///
/// ## Examples
///
/// ```ignore
/// let producer = Producer::builder()
///     .metadata(metadata)
///     .transport(transport)
///     .batch_size(64 * 1024)
///     .linger(Duration::from_millis(10))
///     .acks(Acks::All)
///     .build()?;
/// ```
pub struct ProducerBuilder {
    config: ProducerConfig,
    metadata: Option<Arc<dyn MetadataProvider>>,
    transport: Option<Box<dyn Transport>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ProducerBuilder {
    /// Create a new `ProducerBuilder` with default settings.
    ///
    /// Prefer using `Producer::builder()` instead of calling this directly.
    pub fn new() -> Self {
        Self {
            config: ProducerConfig::default(),
            metadata: None,
            transport: None,
            metrics: None,
        }
    }

    /// Replace the whole configuration, e.g. one loaded from TOML.
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the metadata provider (required).
    pub fn metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the transport (required).
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Export events to an external metrics system.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set the batch size in bytes.
    ///
    /// Larger batches mean fewer requests and more latency under light load.
    ///
    /// # Default
    ///
    /// 16 KiB
    pub fn batch_size(mut self, bytes: usize) -> Self {
        self.config.batch_size = bytes;
        self
    }

    /// Set the total memory available for buffering.
    ///
    /// # Default
    ///
    /// 32 MiB
    pub fn buffer_memory(mut self, bytes: usize) -> Self {
        self.config.buffer_memory = bytes;
        self
    }

    /// Set how long a non-full batch waits for more records.
    ///
    /// # Default
    ///
    /// 0 (send as soon as possible)
    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger_ms = linger.as_millis() as u64;
        self
    }

    /// Set how long `send` may wait for buffer memory.
    pub fn max_block(mut self, max_block: Duration) -> Self {
        self.config.max_block_ms = max_block.as_millis() as u64;
        self
    }

    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.config.max_request_size = bytes;
        self
    }

    /// Set the request timeout, which also bounds how long a batch may wait to be sent.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how many times a batch may be resent after a retriable failure.
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the backoff before the first resend.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn acks(mut self, acks: Acks) -> Self {
        self.config.acks = acks;
        self
    }

    /// Build the producer and spawn its send loop on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `ConfigError` if the configuration is invalid, a required
    ///   collaborator is missing, or no Tokio runtime is running
    pub fn build(self) -> Result<Producer> {
        self.config.validate()?;
        let metadata = self
            .metadata
            .ok_or_else(|| ProducerError::ConfigError("metadata is required".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| ProducerError::ConfigError("transport is required".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ProducerError::ConfigError("producer must be built inside a Tokio runtime".to_string())
        })?;

        let sink = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let instruments = Arc::new(Instruments::new(sink));
        let accumulator = Arc::new(RecordAccumulator::new(&self.config));
        let control = Arc::new(SenderControl::new());

        let sender = Sender::new(
            &self.config,
            Arc::clone(&accumulator),
            Arc::clone(&metadata),
            transport,
            instruments.clone(),
            Arc::clone(&control),
        );
        let handle = runtime.spawn(sender.run());

        info!(
            client_id = %self.config.client_id,
            batch_size = self.config.batch_size,
            buffer_memory = self.config.buffer_memory,
            linger_ms = self.config.linger_ms,
            "Producer initialized"
        );

        Ok(Producer {
            inner: Arc::new(ProducerInner {
                config: self.config,
                accumulator,
                metadata,
                control,
                instruments,
                sender_handle: Mutex::new(Some(handle)),
                round_robin: AtomicU32::new(0),
            }),
        })
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
