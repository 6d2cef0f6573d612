//! Send loop behavior against a scripted transport.
//!
//! Most tests drive `Sender::run_once` step by step on a paused clock, so
//! every request, response and backoff happens at a known point.

mod common;

use common::{mock_transport, now, test_config, two_node_cluster, AutoRespond, MockHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use streamhouse_producer::records::decode;
use streamhouse_producer::{
    Acks, Cluster, ErrorCode, Node, NodeId, PartitionResponse, ProducerConfig, ProducerError,
    ProducerStats, RecordAccumulator, RecordFuture, Sender, SenderControl, SenderState,
    StaticMetadata, TopicPartition,
};

type Log = Arc<Mutex<Vec<(String, bool)>>>;

struct Harness {
    accumulator: Arc<RecordAccumulator>,
    metadata: Arc<StaticMetadata>,
    mock: MockHandle,
    stats: Arc<ProducerStats>,
    sender: Sender,
}

fn harness(config: ProducerConfig) -> Harness {
    harness_with_cluster(config, two_node_cluster())
}

fn harness_with_cluster(config: ProducerConfig, cluster: Cluster) -> Harness {
    common::init_tracing();
    let accumulator = Arc::new(RecordAccumulator::new(&config));
    let metadata = Arc::new(StaticMetadata::new(cluster));
    let (transport, mock) = mock_transport();
    let stats = Arc::new(ProducerStats::new());
    let sender = Sender::new(
        &config,
        Arc::clone(&accumulator),
        metadata.clone(),
        Box::new(transport),
        stats.clone(),
        Arc::new(SenderControl::new()),
    );
    Harness {
        accumulator,
        metadata,
        mock,
        stats,
        sender,
    }
}

impl Harness {
    async fn append(&self, tp: &TopicPartition, value: &str) -> RecordFuture {
        self.accumulator
            .append(tp, None, value.as_bytes(), None, Duration::from_secs(1))
            .await
            .unwrap()
            .future
    }

    async fn append_logged(&self, tp: &TopicPartition, value: &str, log: &Log) -> RecordFuture {
        let log = Arc::clone(log);
        let name = value.to_string();
        self.accumulator
            .append(
                tp,
                None,
                value.as_bytes(),
                Some(Box::new(move |result| log.lock().push((name, result.is_ok())))),
                Duration::from_secs(1),
            )
            .await
            .unwrap()
            .future
    }

    async fn step(&mut self) {
        self.sender.run_once(now()).await.unwrap();
    }

    /// Step until `count` requests went out, failing after a bounded number of steps.
    async fn step_until_sent(&mut self, count: usize) {
        for _ in 0..20 {
            if self.mock.sent_count() >= count {
                return;
            }
            self.step().await;
        }
        assert!(self.mock.sent_count() >= count, "request {} never sent", count);
    }

    fn assert_memory_released(&self) {
        let pool = self.accumulator.pool();
        assert_eq!(pool.available_memory(), pool.total_memory());
        assert_eq!(self.accumulator.incomplete_count(), 0);
    }
}

fn orders(partition: u32) -> TopicPartition {
    TopicPartition::new("orders", partition)
}

fn values(records: &[u8]) -> Vec<String> {
    decode(records)
        .into_iter()
        .map(|(_, value)| String::from_utf8(value).unwrap())
        .collect()
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_ready_batch_is_sent_and_completed() {
    let mut h = harness(test_config());
    let first = h.append(&orders(0), "a").await;
    let second = h.append(&orders(0), "b").await;

    h.step().await;
    let request = h.mock.last_sent();
    assert_eq!(request.destination, NodeId(1));
    assert_eq!(request.acks, Acks::Leader);
    assert_eq!(request.partitions.len(), 1);
    assert_eq!(request.partitions[0].record_count, 2);
    assert_eq!(values(&request.partitions[0].records), vec!["a", "b"]);

    h.mock.respond_success(request.correlation_id);
    h.step().await;

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.offset, Some(0));
    assert_eq!(second.offset, Some(1));
    assert_eq!(second.topic_partition, orders(0));

    assert_eq!(h.stats.snapshot().records_delivered, 2);
    assert_eq!(h.sender.in_flight_requests(), 0);
    h.assert_memory_released();
}

#[tokio::test(start_paused = true)]
async fn test_batches_are_grouped_by_leader() {
    let mut h = harness(test_config());
    let _a = h.append(&orders(0), "a").await;
    let _b = h.append(&orders(1), "b").await;
    let _c = h.append(&TopicPartition::new("events", 0), "c").await;

    h.step().await;

    let sent = h.mock.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].destination, NodeId(1));
    assert_eq!(sent[0].partitions.len(), 2);
    assert_eq!(sent[1].destination, NodeId(2));
    assert_eq!(sent[1].partitions.len(), 1);
    assert_eq!(sent[1].partitions[0].topic_partition, orders(1));
    assert_eq!(h.sender.in_flight_requests(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_linger_holds_batch_until_elapsed() {
    let config = ProducerConfig {
        linger_ms: 50,
        ..test_config()
    };
    let mut h = harness(config);
    let start = now();
    let _a = h.append(&orders(0), "a").await;

    // Nothing is sendable yet, so the loop sleeps until linger runs out.
    h.step().await;
    assert_eq!(h.mock.sent_count(), 0);
    assert!(now() - start >= Duration::from_millis(50));

    h.step().await;
    assert_eq!(h.mock.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_acks_none_completes_without_offsets() {
    let config = ProducerConfig {
        acks: Acks::None,
        ..test_config()
    };
    let mut h = harness(config);
    let future = h.append(&orders(0), "a").await;

    h.step().await;
    h.step().await;

    let metadata = future.await.unwrap();
    assert_eq!(metadata.offset, None);
    assert!(!h.mock.last_sent().expects_response());
    h.assert_memory_released();
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_keeps_partition_order() {
    let mut h = harness(test_config());
    let log: Log = Arc::default();

    let first = h.append_logged(&orders(0), "first", &log).await;
    h.step().await;
    assert_eq!(h.mock.sent_count(), 1);

    let second = h.append_logged(&orders(0), "second", &log).await;
    h.mock.respond_error(0, ErrorCode::NotLeaderForPartition);
    h.step().await;

    // The partition was muted while "first" was in flight, and "first" is back
    // at the head of the queue after failing.
    assert_eq!(h.mock.sent_count(), 1);
    assert!(log.lock().is_empty());
    assert_eq!(h.accumulator.queued_batches(&orders(0)), 2);
    assert!(h.metadata.update_requests() >= 1);
    assert_eq!(h.stats.snapshot().retries, 1);

    // Retry after backoff, carrying only the retried batch.
    let before = now();
    h.step_until_sent(2).await;
    assert!(now() - before >= Duration::from_millis(100));
    let retry = h.mock.last_sent();
    assert_eq!(values(&retry.partitions[0].records), vec!["first"]);

    // "second" stays queued until the retry completes.
    h.mock.respond_success(retry.correlation_id);
    h.step().await;
    assert_eq!(h.mock.sent_count(), 2);

    h.step_until_sent(3).await;
    let next = h.mock.last_sent();
    assert_eq!(values(&next.partitions[0].records), vec!["second"]);
    h.mock.respond_success(next.correlation_id);
    h.step().await;

    assert_eq!(first.await.unwrap().offset, Some(0));
    assert_eq!(second.await.unwrap().offset, Some(1));
    assert_eq!(
        *log.lock(),
        vec![("first".to_string(), true), ("second".to_string(), true)]
    );
    h.assert_memory_released();
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_batch() {
    let config = ProducerConfig {
        retries: 1,
        ..test_config()
    };
    let mut h = harness(config);
    let future = h.append(&orders(0), "a").await;

    h.step().await;
    h.mock.respond_error(0, ErrorCode::NotEnoughReplicas);
    h.step().await;

    h.step_until_sent(2).await;
    h.mock.respond_error(1, ErrorCode::NotEnoughReplicas);
    h.step().await;

    let err = future.await.unwrap_err();
    assert_eq!(err, ProducerError::Broker(orders(0), ErrorCode::NotEnoughReplicas));
    let stats = h.stats.snapshot();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.records_failed, 1);
    assert_eq!(stats.errors, 1);
    h.assert_memory_released();
}

#[tokio::test(start_paused = true)]
async fn test_non_retriable_error_fails_immediately() {
    let mut h = harness(test_config());
    let future = h.append(&orders(0), "a").await;

    h.step().await;
    h.mock.respond_error(0, ErrorCode::TopicAuthorizationFailed);
    h.step().await;

    assert_eq!(
        future.await.unwrap_err(),
        ProducerError::TopicAuthorizationFailed("orders".into())
    );
    assert_eq!(h.mock.sent_count(), 1);
    assert_eq!(h.stats.snapshot().retries, 0);
    h.assert_memory_released();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_retried_with_metadata_refresh() {
    let mut h = harness(test_config());
    let future = h.append(&orders(1), "a").await;

    h.step().await;
    h.mock.disconnect(0);
    h.step().await;
    assert!(h.metadata.update_requests() >= 1);

    h.step_until_sent(2).await;
    assert_eq!(h.mock.last_sent().destination, NodeId(2));
    h.mock.respond_success(1);
    h.step().await;

    assert_eq!(future.await.unwrap().offset, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_is_handled_as_disconnect() {
    let config = ProducerConfig {
        retries: 0,
        ..test_config()
    };
    let mut h = harness(config);
    h.mock.fail_sends(true);
    let future = h.append(&orders(0), "a").await;

    h.step().await;

    assert!(matches!(future.await, Err(ProducerError::Network(_))));
    assert_eq!(h.sender.in_flight_requests(), 0);
    h.assert_memory_released();
}

#[tokio::test(start_paused = true)]
async fn test_partition_missing_from_response_fails_its_batch() {
    let mut h = harness(test_config());
    let events = TopicPartition::new("events", 0);
    let order = h.append(&orders(0), "a").await;
    let event = h.append(&events, "b").await;

    h.step().await;
    let request = h.mock.last_sent();
    assert_eq!(request.partitions.len(), 2);

    h.mock.respond_partitions(
        request.correlation_id,
        vec![PartitionResponse {
            topic_partition: orders(0),
            error: ErrorCode::None,
            base_offset: 42,
        }],
    );
    h.step().await;

    assert_eq!(order.await.unwrap().offset, Some(42));
    assert!(matches!(event.await, Err(ProducerError::Internal(_))));
    h.assert_memory_released();
}

// ============================================================================
// Readiness
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unready_node_is_skipped() {
    let mut h = harness(test_config());
    h.mock.set_not_ready(1, Duration::from_millis(200));
    let _a = h.append(&orders(0), "a").await;
    let _b = h.append(&orders(1), "b").await;

    h.step().await;
    assert_eq!(h.mock.sent_count(), 1);
    assert_eq!(h.mock.last_sent().destination, NodeId(2));

    h.mock.set_ready(1);
    h.step().await;
    assert_eq!(h.mock.sent_count(), 2);
    assert_eq!(h.mock.last_sent().destination, NodeId(1));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_leader_requests_metadata_update() {
    let cluster = Cluster::builder()
        .node(Node::new(1, "broker-1:9092"))
        .leaderless_topic("pending", 1)
        .build();
    let mut h = harness_with_cluster(test_config(), cluster);
    let tp = TopicPartition::new("pending", 0);
    let future = h.append(&tp, "a").await;

    h.step().await;
    assert_eq!(h.mock.sent_count(), 0);
    assert!(h.metadata.update_requests() >= 1);

    h.metadata.update(
        Cluster::builder()
            .node(Node::new(1, "broker-1:9092"))
            .topic("pending", &[1])
            .build(),
    );
    h.step().await;
    assert_eq!(h.mock.sent_count(), 1);

    h.mock.respond_success(0);
    h.step().await;
    assert_eq!(future.await.unwrap().topic_partition, tp);
}

#[tokio::test(start_paused = true)]
async fn test_batch_expires_when_node_stays_unready() {
    let config = ProducerConfig {
        request_timeout_ms: 1000,
        ..test_config()
    };
    let mut h = harness(config);
    h.mock.set_not_ready(1, Duration::from_secs(10));
    let future = h.append(&orders(0), "a").await;

    for _ in 0..5 {
        if h.accumulator.incomplete_count() == 0 {
            break;
        }
        h.step().await;
    }

    assert_eq!(future.await.unwrap_err(), ProducerError::BatchExpired(orders(0)));
    assert_eq!(h.mock.sent_count(), 0);
    assert_eq!(h.stats.snapshot().batches_expired, 1);
    h.assert_memory_released();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_graceful_close_delivers_lingering_batches() {
    let config = ProducerConfig {
        linger_ms: 60_000,
        ..test_config()
    };
    let h = harness(config);
    h.mock.set_auto(Some(AutoRespond::Success));
    let future = h.append(&orders(0), "a").await;

    let control = h.sender.control();
    let accumulator = Arc::clone(&h.accumulator);
    let mock = h.mock.clone();
    let running = tokio::spawn(h.sender.run());

    accumulator.close();
    control.initiate_close();
    running.await.unwrap();

    assert_eq!(future.await.unwrap().offset, Some(0));
    assert_eq!(control.state(), SenderState::Closed);
    assert!(mock.is_closed());
    assert_eq!(accumulator.incomplete_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forced_close_fails_everything_incomplete() {
    let h = harness(test_config());
    let in_flight = h.append(&orders(0), "a").await;

    let control = h.sender.control();
    let accumulator = Arc::clone(&h.accumulator);
    let mock = h.mock.clone();
    let running = tokio::spawn(h.sender.run());

    mock.wait_for_sent(1).await;
    let queued = accumulator
        .append(&orders(0), None, b"b", None, Duration::from_secs(1))
        .await
        .unwrap()
        .future;

    control.force_close();
    running.await.unwrap();

    assert_eq!(in_flight.await.unwrap_err(), ProducerError::ForcedClose);
    assert_eq!(queued.await.unwrap_err(), ProducerError::ForcedClose);
    assert_eq!(control.state(), SenderState::Closed);
    assert!(mock.is_closed());
    let pool = accumulator.pool();
    assert_eq!(pool.available_memory(), pool.total_memory());
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_retry_exhaustion_is_ignored() {
    let config = ProducerConfig {
        retries: 0,
        ..test_config()
    };
    let mut h = harness(config);
    let future = h.append(&orders(0), "a").await;

    h.step().await;
    h.mock.respond_error(0, ErrorCode::RequestTimedOut);
    h.step().await;
    assert!(future.await.is_err());

    // A duplicate answer for the same request has nothing left to complete.
    h.mock.respond_success(0);
    h.step().await;
    assert_eq!(h.stats.snapshot().records_delivered, 0);
    h.assert_memory_released();
}
