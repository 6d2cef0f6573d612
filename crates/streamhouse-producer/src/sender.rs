//! Background send loop.
//!
//! A single [`Sender`] task moves batches from the accumulator to the network
//! and routes responses back to the batches they belong to.
//!
//! ## Iteration
//!
//! ```text
//! fetch cluster ─▶ ready() ─▶ drop unconnected nodes ─▶ drain() ─▶ abort expired
//!       ▲                                                               │
//!       │                                                               ▼
//!  handle responses ◀── poll(min(next ready, next reconnect)) ◀── send requests
//! ```
//!
//! The poll also returns early when a producer wakes the loop, which happens
//! whenever an append fills a batch or opens a new one.
//!
//! ## Shutdown
//!
//! `Running → Draining → Closed`. A graceful close keeps iterating until
//! nothing is queued or in flight. A forced close fails every incomplete batch
//! with `ForcedClose`.

use crate::accumulator::RecordAccumulator;
use crate::batch::ProducerBatch;
use crate::clock;
use crate::cluster::{MetadataProvider, NodeId, TopicPartition};
use crate::config::{Acks, ProducerConfig};
use crate::error::{ProducerError, Result};
use crate::metrics::MetricsSink;
use crate::retry::RetryPolicy;
use crate::transport::{
    ClientResponse, ErrorCode, PartitionData, PartitionResponse, ProduceRequest, Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, trace, warn};

/// Longest the loop sleeps when it has nothing scheduled.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenderState {
    Running = 0,
    Draining = 1,
    Closed = 2,
}

impl SenderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SenderState::Running,
            1 => SenderState::Draining,
            _ => SenderState::Closed,
        }
    }
}

/// Shared handle for steering a running [`Sender`].
#[derive(Debug)]
pub struct SenderControl {
    state: AtomicU8,
    forced: AtomicBool,
    wakeup: Notify,
    closed: watch::Sender<bool>,
}

impl Default for SenderControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SenderState::Running as u8),
            forced: AtomicBool::new(false),
            wakeup: Notify::new(),
            closed: watch::channel(false).0,
        }
    }

    pub fn state(&self) -> SenderState {
        SenderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Interrupt the current poll so the loop re-evaluates readiness.
    pub fn wakeup(&self) {
        self.wakeup.notify_one();
    }

    /// Stop accepting new work and drain what is left.
    pub fn initiate_close(&self) {
        let _ = self.state.compare_exchange(
            SenderState::Running as u8,
            SenderState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wakeup();
    }

    /// Abandon remaining work.
    pub fn force_close(&self) {
        self.forced.store(true, Ordering::Release);
        self.initiate_close();
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// Resolve once the loop has exited. Any number of callers may wait.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        // Never errs: the sender half lives in `self`.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn mark_closed(&self) {
        self.state.store(SenderState::Closed as u8, Ordering::Release);
        self.closed.send_replace(true);
    }
}

/// Marks the loop closed when it exits, including by panic or cancellation.
struct ClosedOnExit(Arc<SenderControl>);

impl Drop for ClosedOnExit {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

struct InFlightRequest {
    destination: NodeId,
    batches: Vec<Arc<ProducerBatch>>,
}

/// The send loop.
pub struct Sender {
    accumulator: Arc<RecordAccumulator>,
    metadata: Arc<dyn MetadataProvider>,
    transport: Box<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    control: Arc<SenderControl>,
    acks: Acks,
    request_timeout: Duration,
    max_request_size: usize,
    retry: RetryPolicy,
    in_flight: HashMap<u32, InFlightRequest>,
    next_correlation_id: u32,
}

impl Sender {
    pub fn new(
        config: &ProducerConfig,
        accumulator: Arc<RecordAccumulator>,
        metadata: Arc<dyn MetadataProvider>,
        transport: Box<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
        control: Arc<SenderControl>,
    ) -> Self {
        Self {
            accumulator,
            metadata,
            transport,
            metrics,
            control,
            acks: config.acks,
            request_timeout: config.request_timeout(),
            max_request_size: config.max_request_size,
            retry: config.retry_policy(),
            in_flight: HashMap::new(),
            next_correlation_id: 0,
        }
    }

    pub fn control(&self) -> Arc<SenderControl> {
        Arc::clone(&self.control)
    }

    /// Requests sent and not yet answered.
    pub fn in_flight_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Run until closed.
    pub async fn run(mut self) {
        let _closed = ClosedOnExit(Arc::clone(&self.control));
        debug!("Starting producer send loop");

        while self.control.state() == SenderState::Running {
            self.run_once_logged().await;
        }

        debug!("Beginning shutdown of producer send loop, sending remaining records");

        while !self.control.is_forced() && self.has_pending_work() {
            self.run_once_logged().await;
        }

        if self.control.is_forced() {
            let aborted = self.accumulator.abort_incomplete_batches().await;
            self.in_flight.clear();
            debug!(aborted, "Forced close aborted incomplete batches");
        }

        self.transport.close().await;
        debug!("Shutdown of producer send loop complete");
    }

    fn has_pending_work(&self) -> bool {
        self.accumulator.has_unsent()
            || !self.in_flight.is_empty()
            || self.transport.in_flight_count() > 0
    }

    async fn run_once_logged(&mut self) {
        if let Err(e) = self.run_once(clock::now()).await {
            error!(error = %e, "Uncaught error in producer send loop");
        }
    }

    /// One iteration of the send loop.
    pub async fn run_once(&mut self, now: Instant) -> Result<()> {
        let cluster = self.metadata.fetch();

        let mut result = self.accumulator.ready(&cluster, now);
        if result.unknown_leaders_exist {
            trace!("Requesting metadata update for partitions with unknown leader");
            self.metadata.request_update();
        }

        let mut not_ready_timeout = Duration::MAX;
        result.ready_nodes.retain(|id| match cluster.node(*id) {
            Some(node) => {
                if self.transport.is_ready(node, now) {
                    true
                } else {
                    not_ready_timeout =
                        not_ready_timeout.min(self.transport.connection_delay(node, now));
                    false
                }
            }
            None => false,
        });

        let drained =
            self.accumulator
                .drain(&cluster, &result.ready_nodes, self.max_request_size, now);
        for batch in drained.values().flatten() {
            self.accumulator.mute(batch.topic_partition());
            self.metrics.batch_drained(
                batch.topic_partition(),
                batch.record_count(),
                batch.size_in_bytes(),
                now.saturating_duration_since(batch.created_at()),
            );
        }

        for batch in self.accumulator.abort_expired_batches(now) {
            warn!(
                topic = %batch.topic_partition().topic(),
                partition = batch.topic_partition().partition(),
                records = batch.record_count(),
                "Expired batch before it could be sent"
            );
            self.metrics.batch_completed(
                batch.topic_partition(),
                batch.record_count(),
                Some(&ProducerError::BatchExpired(batch.topic_partition().clone())),
            );
        }

        let pool = self.accumulator.pool();
        self.metrics
            .buffer_state(pool.available_memory(), pool.total_memory(), pool.queued());

        let mut poll_timeout = result.next_ready_check_delay.min(not_ready_timeout);
        if !result.ready_nodes.is_empty() {
            poll_timeout = Duration::ZERO;
        }

        for (node, batches) in drained {
            if !batches.is_empty() {
                self.send_produce_request(node, batches, now);
            }
        }

        let poll_timeout = poll_timeout.min(MAX_POLL_TIMEOUT);
        let responses = tokio::select! {
            biased;
            responses = self.transport.poll(poll_timeout, now) => responses?,
            _ = self.control.wakeup.notified() => Vec::new(),
        };

        let now = clock::now();
        for response in responses {
            self.handle_response(response, now);
        }
        Ok(())
    }

    fn send_produce_request(&mut self, node: NodeId, batches: Vec<Arc<ProducerBatch>>, now: Instant) {
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);

        let request = ProduceRequest {
            correlation_id,
            destination: node,
            acks: self.acks,
            timeout: self.request_timeout,
            partitions: batches
                .iter()
                .map(|batch| PartitionData {
                    topic_partition: batch.topic_partition().clone(),
                    record_count: batch.record_count(),
                    records: batch.records(),
                })
                .collect(),
        };

        trace!(
            node = %node,
            correlation_id,
            acks = request.acks.as_i16(),
            partitions = request.partitions.len(),
            bytes = request.size_in_bytes(),
            "Sending produce request"
        );

        self.in_flight.insert(
            correlation_id,
            InFlightRequest {
                destination: node,
                batches,
            },
        );

        if let Err(e) = self.transport.send(request, now) {
            warn!(node = %node, correlation_id, error = %e, "Failed to send produce request");
            self.handle_response(ClientResponse::disconnected(correlation_id, node), now);
        }
    }

    fn handle_response(&mut self, response: ClientResponse, now: Instant) {
        let Some(request) = self.in_flight.remove(&response.correlation_id) else {
            warn!(
                correlation_id = response.correlation_id,
                node = %response.destination,
                "Dropping response for unknown request"
            );
            return;
        };

        if response.disconnected {
            warn!(
                correlation_id = response.correlation_id,
                node = %request.destination,
                "Cancelled request due to node being disconnected"
            );
            for batch in request.batches {
                let error = ProducerError::from_broker(batch.topic_partition(), ErrorCode::NetworkException);
                self.complete_batch(batch, Err(error), now);
            }
            return;
        }

        match response.body {
            Some(body) => {
                let mut by_partition: HashMap<TopicPartition, PartitionResponse> = body
                    .partitions
                    .into_iter()
                    .map(|p| (p.topic_partition.clone(), p))
                    .collect();
                for batch in request.batches {
                    let outcome = match by_partition.remove(batch.topic_partition()) {
                        Some(p) if p.error == ErrorCode::None => Ok(Some(p.base_offset)),
                        Some(p) => Err(ProducerError::from_broker(&p.topic_partition, p.error)),
                        None => Err(ProducerError::Internal(format!(
                            "response from {} did not include {}",
                            request.destination,
                            batch.topic_partition()
                        ))),
                    };
                    self.complete_batch(batch, outcome, now);
                }
            }
            // acks = 0: nothing to wait for.
            None => {
                for batch in request.batches {
                    self.complete_batch(batch, Ok(None), now);
                }
            }
        }
    }

    fn complete_batch(&mut self, batch: Arc<ProducerBatch>, outcome: Result<Option<u64>>, now: Instant) {
        let tp = batch.topic_partition().clone();

        if let Err(error) = &outcome {
            if invalidates_metadata(error) {
                self.metadata.request_update();
            }

            if !self.control.is_forced() && self.retry.can_retry(batch.attempts(), error) {
                warn!(
                    topic = %tp.topic(),
                    partition = tp.partition(),
                    attempts = batch.attempts() + 1,
                    max_retries = self.retry.max_retries,
                    error = %error,
                    "Got error produce response, retrying"
                );
                let attempts = self.accumulator.reenqueue(batch, now);
                self.accumulator.unmute(&tp);
                self.metrics.batch_retried(&tp, attempts);
                return;
            }

            warn!(
                topic = %tp.topic(),
                partition = tp.partition(),
                attempts = batch.attempts(),
                error = %error,
                "Failed to deliver batch"
            );
        }

        let error = outcome.as_ref().err().cloned();
        let records = batch.record_count();
        batch.complete(outcome);
        self.accumulator.deallocate(&batch);
        self.accumulator.unmute(&tp);
        self.metrics.batch_completed(&tp, records, error.as_ref());
    }
}

/// Errors after which our view of partition leadership should be refreshed.
fn invalidates_metadata(error: &ProducerError) -> bool {
    match error {
        ProducerError::Network(_) => true,
        ProducerError::Broker(_, code) => code.is_invalid_metadata(),
        _ => false,
    }
}
