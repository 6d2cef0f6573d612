//! Record accumulator.
//!
//! The accumulator sits between producer tasks and the send loop. Producers
//! append records into per-partition queues of [`ProducerBatch`]es; the send
//! loop asks which destinations have something worth sending and drains
//! batches out grouped by destination.
//!
//! ## Architecture
//!
//! ```text
//!  send() ──append──▶ ┌──────────────────────────────────────────┐
//!                     │  batches: tp → Mutex<VecDeque<Batch>>    │
//!                     │    orders-0: [b1(full)] [b2(open)]       │
//!                     │    orders-1: [b3(open)]                  │
//!                     └──────┬───────────────────────────────────┘
//!                            │ ready(cluster) → {node-1, node-2}
//!                            │ drain(cluster, nodes, max_size)
//!                            ▼
//!                     node-1: [b1, b3]   node-2: [...]
//! ```
//!
//! ## Locking
//!
//! The partition map is behind a `RwLock` that is only write-locked to add a
//! new partition. Each queue has its own mutex, so appends to different
//! partitions never contend. Lock order is map, then queue, then batch.
//! No lock is held while waiting for buffer memory.
//!
//! ## Ordering
//!
//! Within a partition, batches are sent in creation order. A batch that fails
//! retriably goes back to the head of its queue. A partition with a batch in
//! flight is muted: it is neither reported ready nor drained until that batch
//! completes or is re-enqueued, so a newer batch can never overtake an older
//! one.

use crate::batch::{Callback, ProducerBatch, RecordFuture, TryAppend};
use crate::clock;
use crate::cluster::{Cluster, NodeId, TopicPartition};
use crate::config::ProducerConfig;
use crate::error::{ProducerError, Result};
use crate::pool::BufferPool;
use crate::records::record_size;
use crate::retry::{ExpiryPolicy, RetryPolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

type PartitionQueue = Arc<Mutex<VecDeque<Arc<ProducerBatch>>>>;

/// Outcome of a successful [`RecordAccumulator::append`].
#[derive(Debug)]
pub struct RecordAppendResult {
    /// Resolves when the record's batch completes
    pub future: RecordFuture,
    /// The batch the record landed in cannot take more records
    pub batch_is_full: bool,
    /// The append opened a new batch
    pub new_batch_created: bool,
}

/// Outcome of [`RecordAccumulator::ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCheckResult {
    /// Destinations with at least one sendable batch
    pub ready_nodes: BTreeSet<NodeId>,
    /// How long until some currently unsendable batch becomes sendable
    pub next_ready_check_delay: Duration,
    /// Some partition with queued data has no known leader
    pub unknown_leaders_exist: bool,
}

/// Batches that have been created and not yet completed.
#[derive(Debug, Default)]
struct IncompleteBatches {
    batches: Mutex<HashMap<u64, Arc<ProducerBatch>>>,
}

impl IncompleteBatches {
    fn add(&self, batch: Arc<ProducerBatch>) {
        self.batches.lock().insert(batch.id(), batch);
    }

    fn remove(&self, batch: &ProducerBatch) -> bool {
        self.batches.lock().remove(&batch.id()).is_some()
    }

    /// Snapshot, oldest first.
    fn all(&self) -> Vec<Arc<ProducerBatch>> {
        let mut batches: Vec<_> = self.batches.lock().values().cloned().collect();
        batches.sort_by_key(|b| b.id());
        batches
    }

    fn len(&self) -> usize {
        self.batches.lock().len()
    }
}

/// Decrements a counter when dropped, waking `idle` when it reaches zero.
struct InProgress<'a> {
    counter: &'a AtomicUsize,
    idle: &'a Notify,
}

impl<'a> InProgress<'a> {
    fn enter(counter: &'a AtomicUsize, idle: &'a Notify) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter, idle }
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Per-partition batch queues backed by a bounded buffer pool.
///
/// # Examples
///
/// ```ignore
/// let accumulator = RecordAccumulator::new(&ProducerConfig::default());
/// let tp = TopicPartition::new("orders", 0);
///
/// let result = accumulator
///     .append(&tp, Some(b"user-1"), b"payload", None, Duration::from_secs(1))
///     .await?;
///
/// let ready = accumulator.ready(&cluster, now);
/// let drained = accumulator.drain(&cluster, &ready.ready_nodes, 1024 * 1024, now);
/// ```
#[derive(Debug)]
pub struct RecordAccumulator {
    batch_size: usize,
    linger: Duration,
    retry: RetryPolicy,
    expiry: ExpiryPolicy,
    pool: BufferPool,
    batches: RwLock<BTreeMap<TopicPartition, PartitionQueue>>,
    incomplete: IncompleteBatches,
    muted: Mutex<HashSet<TopicPartition>>,
    closed: AtomicBool,
    flushes_in_progress: AtomicUsize,
    appends_in_progress: AtomicUsize,
    appends_idle: Notify,
    drain_index: AtomicUsize,
    next_batch_id: AtomicU64,
}

impl RecordAccumulator {
    pub fn new(config: &ProducerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            linger: config.linger(),
            retry: config.retry_policy(),
            expiry: config.expiry_policy(),
            pool: BufferPool::new(config.buffer_memory, config.batch_size),
            batches: RwLock::new(BTreeMap::new()),
            incomplete: IncompleteBatches::default(),
            muted: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            flushes_in_progress: AtomicUsize::new(0),
            appends_in_progress: AtomicUsize::new(0),
            appends_idle: Notify::new(),
            drain_index: AtomicUsize::new(0),
            next_batch_id: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Append path
    // ========================================================================

    /// Append a record to the open batch of `tp`, opening a new batch if needed.
    ///
    /// May wait up to `max_wait` for buffer memory. No lock is held during
    /// that wait, so other partitions keep accepting appends.
    ///
    /// # Errors
    ///
    /// - `Closed` if the accumulator is closed
    /// - `BufferExhausted` if no memory freed up within `max_wait`
    /// - `RecordTooLarge` if the record exceeds total buffer memory
    pub async fn append(
        &self,
        tp: &TopicPartition,
        key: Option<&[u8]>,
        value: &[u8],
        callback: Option<Callback>,
        max_wait: Duration,
    ) -> Result<RecordAppendResult> {
        let _in_progress = InProgress::enter(&self.appends_in_progress, &self.appends_idle);
        if self.closed.load(Ordering::Acquire) {
            return Err(ProducerError::Closed);
        }

        let queue = self.queue_for(tp);
        let callback = {
            let dq = queue.lock();
            match self.try_append_to(&dq, key, value, callback, clock::now()) {
                Ok(result) => return Ok(result),
                Err(callback) => callback,
            }
        };

        let size = self.batch_size.max(record_size(key, value));
        trace!(
            topic = %tp.topic(),
            partition = tp.partition(),
            size,
            "Allocating buffer for new batch"
        );
        let buffer = self.pool.allocate(size, max_wait).await?;

        let mut dq = queue.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(dq);
            self.pool.deallocate(buffer, size);
            return Err(ProducerError::Closed);
        }

        let now = clock::now();
        // Another task may have opened a batch while we waited for memory.
        let callback = match self.try_append_to(&dq, key, value, callback, now) {
            Ok(result) => {
                drop(dq);
                self.pool.deallocate(buffer, size);
                return Ok(result);
            }
            Err(callback) => callback,
        };

        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let batch = Arc::new(ProducerBatch::new(id, tp.clone(), buffer, self.batch_size, now));
        let future = match batch.try_append(key, value, callback, now) {
            TryAppend::Appended(future) => future,
            TryAppend::NoRoom(_) => {
                drop(dq);
                self.pool.deallocate(batch.take_buffer(), size);
                return Err(ProducerError::Internal(
                    "new batch rejected its first record".into(),
                ));
            }
        };

        dq.push_back(Arc::clone(&batch));
        self.incomplete.add(Arc::clone(&batch));

        debug!(
            topic = %tp.topic(),
            partition = tp.partition(),
            batch_id = id,
            queued = dq.len(),
            "Created new batch"
        );

        Ok(RecordAppendResult {
            future,
            batch_is_full: dq.len() > 1 || batch.is_full(),
            new_batch_created: true,
        })
    }

    /// Try the last batch of a queue. Hands the callback back on failure.
    ///
    /// A batch under its soft limit may grow past it, but only with bytes
    /// reserved from the pool.
    fn try_append_to(
        &self,
        dq: &VecDeque<Arc<ProducerBatch>>,
        key: Option<&[u8]>,
        value: &[u8],
        callback: Option<Callback>,
        now: Instant,
    ) -> std::result::Result<RecordAppendResult, Option<Callback>> {
        let Some(last) = dq.back() else {
            return Err(callback);
        };
        match last.try_append_or_grow(key, value, callback, now, |extra| {
            self.pool.try_reserve(extra)
        }) {
            TryAppend::Appended(future) => Ok(RecordAppendResult {
                future,
                batch_is_full: dq.len() > 1 || last.is_full(),
                new_batch_created: false,
            }),
            TryAppend::NoRoom(callback) => Err(callback),
        }
    }

    fn queue_for(&self, tp: &TopicPartition) -> PartitionQueue {
        if let Some(queue) = self.batches.read().get(tp) {
            return Arc::clone(queue);
        }
        let mut batches = self.batches.write();
        Arc::clone(batches.entry(tp.clone()).or_default())
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Destinations that have a sendable batch at the head of some partition.
    ///
    /// A head batch is sendable when it is full, its linger (or retry
    /// backoff) has elapsed, the pool has blocked allocators, or the
    /// accumulator is closing or flushing. Batches still backing off are
    /// never sendable.
    pub fn ready(&self, cluster: &Cluster, now: Instant) -> ReadyCheckResult {
        let mut ready_nodes = BTreeSet::new();
        let mut next_ready_check_delay = Duration::MAX;
        let mut unknown_leaders_exist = false;

        let exhausted = self.pool.queued() > 0;
        let closed = self.closed.load(Ordering::Acquire);
        let flushing = self.flush_in_progress();
        let muted = self.muted.lock().clone();

        for (tp, queue) in self.batches.read().iter() {
            if muted.contains(tp) {
                continue;
            }
            let dq = queue.lock();
            let Some(batch) = dq.front() else {
                continue;
            };

            let Some(leader) = cluster.leader_for(tp) else {
                unknown_leaders_exist = true;
                continue;
            };
            if ready_nodes.contains(&leader.id) {
                continue;
            }

            let backing_off = batch.is_backing_off(now);
            let sendable_at = batch.sendable_at(self.linger);
            let full = dq.len() > 1 || batch.is_full();
            let lingered = now >= sendable_at;
            let sendable = full || lingered || exhausted || closed || flushing;

            if sendable && !backing_off {
                ready_nodes.insert(leader.id);
            } else {
                next_ready_check_delay =
                    next_ready_check_delay.min(sendable_at.saturating_duration_since(now));
            }
        }

        ReadyCheckResult {
            ready_nodes,
            next_ready_check_delay,
            unknown_leaders_exist,
        }
    }

    /// Remove sendable batches for each of `nodes`, at most `max_size` bytes per node.
    ///
    /// Partitions of a node are visited round-robin from where the previous
    /// drain stopped, taking at most one batch per partition. A single batch
    /// larger than `max_size` is drained on its own. Drained batches are
    /// closed and stamped with `now`.
    pub fn drain(
        &self,
        cluster: &Cluster,
        nodes: &BTreeSet<NodeId>,
        max_size: usize,
        now: Instant,
    ) -> BTreeMap<NodeId, Vec<Arc<ProducerBatch>>> {
        let mut drained = BTreeMap::new();
        if nodes.is_empty() {
            return drained;
        }

        let queues = self.batches.read();
        let muted = self.muted.lock().clone();

        for node in nodes {
            let partitions = cluster.partitions_for_node(*node);
            let mut ready = Vec::new();
            if partitions.is_empty() {
                drained.insert(*node, ready);
                continue;
            }

            let mut size = 0usize;
            let mut index = self.drain_index.load(Ordering::Relaxed) % partitions.len();
            let start = index;
            loop {
                let tp = &partitions[index];
                if !muted.contains(tp) {
                    if let Some(queue) = queues.get(tp) {
                        let mut dq = queue.lock();
                        if let Some(first) = dq.front() {
                            if !first.is_backing_off(now) {
                                if size + first.size_in_bytes() > max_size && !ready.is_empty() {
                                    // Resume from this partition next time.
                                    break;
                                }
                                if let Some(batch) = dq.pop_front() {
                                    batch.mark_drained(now);
                                    size += batch.size_in_bytes();
                                    ready.push(batch);
                                }
                            }
                        }
                    }
                }
                index = (index + 1) % partitions.len();
                if index == start {
                    break;
                }
            }
            self.drain_index.store(index, Ordering::Relaxed);

            trace!(node = %node, batches = ready.len(), bytes = size, "Drained batches");
            drained.insert(*node, ready);
        }

        drained
    }

    /// Fail batches that have sat in their queue past the expiry window.
    ///
    /// Batches under retry are skipped. For each partition the scan stops at
    /// the first batch that is neither expired nor under retry, since later
    /// batches are younger. Muted partitions are left alone. Expired batches
    /// are completed with `BatchExpired` and their memory released; they are
    /// returned for reporting.
    pub fn abort_expired_batches(&self, now: Instant) -> Vec<Arc<ProducerBatch>> {
        let mut expired = Vec::new();
        let muted = self.muted.lock().clone();

        for (tp, queue) in self.batches.read().iter() {
            if muted.contains(tp) {
                continue;
            }
            let mut dq = queue.lock();
            let mut i = 0;
            while i < dq.len() {
                let has_successor = i + 1 < dq.len();
                let batch = &dq[i];
                if batch.is_expired_in_queue(&self.expiry, self.linger, now, has_successor) {
                    if let Some(batch) = dq.remove(i) {
                        expired.push(batch);
                    }
                    continue;
                }
                if !batch.in_retry() {
                    break;
                }
                i += 1;
            }
        }

        for batch in &expired {
            batch.expire();
            self.deallocate(batch);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired batches");
        }
        expired
    }

    /// Put a retriably failed batch back at the head of its queue.
    ///
    /// Bumps the attempt count and schedules the batch after the retry
    /// backoff for that attempt. Returns the new attempt count.
    pub fn reenqueue(&self, batch: Arc<ProducerBatch>, now: Instant) -> u32 {
        let backoff = self.retry.retry_backoff_for(batch.attempts() + 1);
        let attempts = batch.prepare_retry(now, backoff);
        let queue = self.queue_for(batch.topic_partition());
        queue.lock().push_front(batch);
        attempts
    }

    /// Release a completed batch's memory. Safe to call more than once.
    pub fn deallocate(&self, batch: &ProducerBatch) {
        if self.incomplete.remove(batch) {
            let size = batch.reserved_bytes();
            self.pool.deallocate(batch.take_buffer(), size);
        }
    }

    /// Stop draining `tp` until it is unmuted.
    pub fn mute(&self, tp: &TopicPartition) {
        self.muted.lock().insert(tp.clone());
    }

    pub fn unmute(&self, tp: &TopicPartition) {
        self.muted.lock().remove(tp);
    }

    /// Any partition has queued batches.
    pub fn has_unsent(&self) -> bool {
        self.batches.read().values().any(|q| !q.lock().is_empty())
    }

    // ========================================================================
    // Flush and shutdown
    // ========================================================================

    /// Make every partition ready until the matching `await_flush_completion` returns.
    pub fn begin_flush(&self) {
        self.flushes_in_progress.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait for every batch incomplete at call time to complete.
    ///
    /// Ends the flush started by `begin_flush`, also when cancelled.
    pub async fn await_flush_completion(&self) {
        struct EndFlush<'a>(&'a AtomicUsize);
        impl Drop for EndFlush<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::AcqRel);
            }
        }
        let _end = EndFlush(&self.flushes_in_progress);

        for batch in self.incomplete.all() {
            batch.await_completion().await;
        }
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flushes_in_progress.load(Ordering::Acquire) > 0
    }

    /// Reject further appends. Queued batches become ready immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail every incomplete batch with `ForcedClose`.
    ///
    /// Blocked allocations are woken with `Closed`, and the abort repeats
    /// until no append is in progress so that a batch created concurrently
    /// is not left behind. Returns the number of batches aborted.
    pub async fn abort_incomplete_batches(&self) -> usize {
        self.close();
        self.pool.close();

        let mut aborted = 0;
        loop {
            aborted += self.abort_batches();
            if self.wait_for_appends_idle().await {
                break;
            }
        }
        aborted += self.abort_batches();
        self.batches.write().clear();
        self.muted.lock().clear();

        debug!(aborted, "Aborted incomplete batches");
        aborted
    }

    /// Returns `true` if no append was in progress, otherwise waits for the
    /// in-progress appends to finish and returns `false`.
    async fn wait_for_appends_idle(&self) -> bool {
        let idle = self.appends_idle.notified();
        tokio::pin!(idle);
        idle.as_mut().enable();
        if self.appends_in_progress.load(Ordering::Acquire) == 0 {
            return true;
        }
        idle.await;
        false
    }

    fn abort_batches(&self) -> usize {
        let batches = self.incomplete.all();
        for batch in &batches {
            if let Some(queue) = self.batches.read().get(batch.topic_partition()) {
                queue.lock().retain(|b| !Arc::ptr_eq(b, batch));
            }
            batch.close();
            batch.complete(Err(ProducerError::ForcedClose));
            self.deallocate(batch);
        }
        batches.len()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Batches created and not yet completed.
    pub fn incomplete_count(&self) -> usize {
        self.incomplete.len()
    }

    /// Batches queued for `tp`, not counting drained ones.
    pub fn queued_batches(&self, tp: &TopicPartition) -> usize {
        self.batches
            .read()
            .get(tp)
            .map_or(0, |queue| queue.lock().len())
    }

    pub fn linger(&self) -> Duration {
        self.linger
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}
