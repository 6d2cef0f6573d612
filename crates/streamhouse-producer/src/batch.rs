//! Producer batches.
//!
//! A [`ProducerBatch`] collects the records appended to one partition between
//! two sends. Every record appended gets a [`RecordFuture`] (and optionally a
//! [`Callback`]) that resolves when the batch reaches its single terminal
//! outcome.
//!
//! ## Lifecycle
//!
//! ```text
//!   new ──▶ open ──try_append──▶ full/closed ──drain──▶ in flight
//!                                                        │
//!              ┌──────────── prepare_retry ◀── retriable error
//!              ▼                                         │
//!         queue head                                     ▼
//!                                             complete(Ok | Err)  (exactly once)
//! ```
//!
//! ## Thread Safety
//!
//! Producer tasks append while the send loop inspects and drains, so the
//! mutable part of a batch sits behind a `parking_lot::Mutex`. The terminal
//! transition is an atomic compare-and-swap: whichever caller flips
//! `completed` first runs the callbacks, every later caller is a no-op.
//! Callbacks run outside the lock and a panicking callback is logged and
//! skipped without affecting the others.

use crate::clock;
use crate::cluster::TopicPartition;
use crate::error::{ProducerError, Result};
use crate::records::{record_size, MemoryRecords};
use crate::retry::ExpiryPolicy;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{error, trace};

/// Per-record completion hook. Invoked exactly once with the record's outcome.
pub type Callback = Box<dyn FnOnce(Result<RecordMetadata>) + Send + 'static>;

/// Where a record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic_partition: TopicPartition,
    /// Absolute offset, `None` when the destination did not report one (acks = 0)
    pub offset: Option<u64>,
    /// Position of the record inside its batch
    pub relative_offset: u32,
}

struct Thunk {
    relative_offset: u32,
    callback: Option<Callback>,
    tx: oneshot::Sender<Result<RecordMetadata>>,
}

struct BatchState {
    records: MemoryRecords,
    max_record_size: usize,
    last_append: Instant,
    last_attempt: Instant,
    drained_at: Option<Instant>,
    retry_at: Option<Instant>,
    in_retry: bool,
    thunks: Vec<Thunk>,
}

/// Result of [`ProducerBatch::try_append`].
pub enum TryAppend {
    Appended(RecordFuture),
    /// The batch cannot take the record. The callback is handed back so the
    /// caller can retry against a fresh batch.
    NoRoom(Option<Callback>),
}

/// Records buffered for one partition, sent as a unit.
pub struct ProducerBatch {
    id: u64,
    topic_partition: TopicPartition,
    created_at: Instant,
    attempts: AtomicU32,
    completed: AtomicBool,
    state: Mutex<BatchState>,
    done: watch::Sender<bool>,
}

impl ProducerBatch {
    /// Create an empty batch over a buffer drawn from the pool.
    ///
    /// # Arguments
    ///
    /// * `id` - Unique id, used to track the batch until it completes
    /// * `topic_partition` - Destination partition
    /// * `buffer` - Pool buffer; its capacity plus any growth is returned on deallocation
    /// * `write_limit` - Soft size limit (the configured batch size)
    /// * `now` - Creation time
    pub fn new(
        id: u64,
        topic_partition: TopicPartition,
        buffer: BytesMut,
        write_limit: usize,
        now: Instant,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            topic_partition,
            created_at: now,
            attempts: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            state: Mutex::new(BatchState {
                records: MemoryRecords::new(buffer, write_limit),
                max_record_size: 0,
                last_append: now,
                last_attempt: now,
                drained_at: None,
                retry_at: None,
                in_retry: false,
                thunks: Vec::new(),
            }),
            done,
        }
    }

    /// Append a record if the batch has room.
    ///
    /// Never appends partially: either the whole record is framed into the
    /// buffer and a future is returned, or nothing changes.
    pub fn try_append(
        &self,
        key: Option<&[u8]>,
        value: &[u8],
        callback: Option<Callback>,
        now: Instant,
    ) -> TryAppend {
        self.try_append_or_grow(key, value, callback, now, |_| false)
    }

    /// Like [`ProducerBatch::try_append`], but a batch still under its soft
    /// limit may take a record past it if `reserve` grants the extra bytes.
    pub fn try_append_or_grow(
        &self,
        key: Option<&[u8]>,
        value: &[u8],
        callback: Option<Callback>,
        now: Instant,
        reserve: impl FnOnce(usize) -> bool,
    ) -> TryAppend {
        let mut state = self.state.lock();
        if !state.records.has_room_for(key, value) {
            match state.records.overflow_for(key, value) {
                Some(extra) if reserve(extra) => {
                    state.records.grow(extra);
                    trace!(batch_id = self.id, extra, "Grew batch past its soft limit");
                }
                _ => return TryAppend::NoRoom(callback),
            }
        }

        let relative_offset = state.records.append(key, value);
        state.max_record_size = state.max_record_size.max(record_size(key, value));
        state.last_append = now;

        let (tx, rx) = oneshot::channel();
        state.thunks.push(Thunk {
            relative_offset,
            callback,
            tx,
        });

        trace!(
            topic = %self.topic_partition.topic(),
            partition = self.topic_partition.partition(),
            relative_offset,
            "Appended record to batch"
        );

        TryAppend::Appended(RecordFuture {
            rx,
            topic_partition: self.topic_partition.clone(),
            relative_offset,
        })
    }

    /// Deliver the terminal outcome to every record.
    ///
    /// `Ok(Some(base))` gives record `i` the offset `base + i`. `Ok(None)` is
    /// success without offsets. Returns `false` if the batch was already
    /// completed, in which case nothing happens.
    pub fn complete(&self, result: Result<Option<u64>>) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let thunks = {
            let mut state = self.state.lock();
            state.records.close();
            std::mem::take(&mut state.thunks)
        };

        trace!(
            topic = %self.topic_partition.topic(),
            partition = self.topic_partition.partition(),
            records = thunks.len(),
            success = result.is_ok(),
            "Completing batch"
        );

        for thunk in thunks {
            let outcome = match &result {
                Ok(base_offset) => Ok(RecordMetadata {
                    topic_partition: self.topic_partition.clone(),
                    offset: base_offset.map(|base| base + u64::from(thunk.relative_offset)),
                    relative_offset: thunk.relative_offset,
                }),
                Err(e) => Err(e.clone()),
            };

            if let Some(callback) = thunk.callback {
                let arg = outcome.clone();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(arg))) {
                    error!(
                        topic = %self.topic_partition.topic(),
                        partition = self.topic_partition.partition(),
                        relative_offset = thunk.relative_offset,
                        panic = %panic_message(&*panic),
                        "Producer callback panicked"
                    );
                }
            }

            // The caller may have dropped the future.
            let _ = thunk.tx.send(outcome);
        }

        self.done.send_replace(true);
        true
    }

    /// Wait until the batch has completed.
    pub async fn await_completion(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`, so this only returns on completion.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_done(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether the batch has waited long enough to be failed.
    ///
    /// Batches under retry are exempt.
    pub fn is_expired(&self, policy: &ExpiryPolicy, linger: Duration, now: Instant) -> bool {
        self.is_expired_in_queue(policy, linger, now, false)
    }

    /// Expiry check for a queued batch. A batch with a successor in its
    /// queue can take no more appends and counts as full.
    pub(crate) fn is_expired_in_queue(
        &self,
        policy: &ExpiryPolicy,
        linger: Duration,
        now: Instant,
        has_successor: bool,
    ) -> bool {
        let state = self.state.lock();
        !state.in_retry
            && policy.is_expired(
                has_successor || state.records.is_full(),
                state.last_append,
                state.last_attempt,
                linger,
                now,
            )
    }

    /// Fail the batch with `BatchExpired`.
    pub fn expire(&self) -> bool {
        self.complete(Err(ProducerError::BatchExpired(self.topic_partition.clone())))
    }

    /// Expire the batch if it has waited too long. Returns whether it did.
    pub fn maybe_expire(&self, policy: &ExpiryPolicy, linger: Duration, now: Instant) -> bool {
        self.is_expired(policy, linger, now) && self.expire()
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// Returns the new attempt count.
    pub fn prepare_retry(&self, now: Instant, backoff: Duration) -> u32 {
        let mut state = self.state.lock();
        state.in_retry = true;
        state.last_attempt = now;
        state.last_append = now;
        state.retry_at = Some(clock::saturating_add(now, backoff));
        state.drained_at = None;
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether the batch is still waiting out its retry backoff.
    pub fn is_backing_off(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state.in_retry && state.retry_at.is_some_and(|at| at > now)
    }

    /// Earliest time the batch may be sent.
    ///
    /// A fresh batch waits for linger unless it fills up first. A retried
    /// batch is sendable as soon as its backoff ends.
    pub fn sendable_at(&self, linger: Duration) -> Instant {
        let state = self.state.lock();
        match (state.in_retry, state.retry_at) {
            (true, Some(at)) => at,
            _ => clock::saturating_add(state.last_attempt, linger),
        }
    }

    /// Stop accepting appends.
    pub fn close(&self) {
        self.state.lock().records.close();
    }

    /// Close the batch and stamp the drain time.
    pub fn mark_drained(&self, now: Instant) {
        let mut state = self.state.lock();
        state.records.close();
        state.drained_at = Some(now);
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().records.is_full()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn in_retry(&self) -> bool {
        self.state.lock().in_retry
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_attempt(&self) -> Instant {
        self.state.lock().last_attempt
    }

    pub fn drained_at(&self) -> Option<Instant> {
        self.state.lock().drained_at
    }

    pub fn record_count(&self) -> u32 {
        self.state.lock().records.record_count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.state.lock().records.size_in_bytes()
    }

    pub fn max_record_size(&self) -> usize {
        self.state.lock().max_record_size
    }

    /// Bytes drawn from the pool for this batch.
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().records.reserved_bytes()
    }

    /// Copy of the framed records, for building a request.
    pub fn records(&self) -> Bytes {
        Bytes::copy_from_slice(self.state.lock().records.as_bytes())
    }

    /// Take the pool buffer out for deallocation.
    pub(crate) fn take_buffer(&self) -> BytesMut {
        self.state.lock().records.take_buffer()
    }
}

impl fmt::Debug for ProducerBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBatch")
            .field("id", &self.id)
            .field("topic_partition", &self.topic_partition)
            .field("attempts", &self.attempts())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves to a record's outcome once its batch completes.
///
/// Dropping the future does not cancel the record.
#[derive(Debug)]
pub struct RecordFuture {
    rx: oneshot::Receiver<Result<RecordMetadata>>,
    topic_partition: TopicPartition,
    relative_offset: u32,
}

impl RecordFuture {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn relative_offset(&self) -> u32 {
        self.relative_offset
    }
}

impl Future for RecordFuture {
    type Output = Result<RecordMetadata>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProducerError::Internal(
                "batch dropped before completion".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
