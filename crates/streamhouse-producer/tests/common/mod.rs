//! Shared fixtures for integration tests: an in-memory transport whose
//! behavior tests script through a handle.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamhouse_producer::{
    Acks, ClientResponse, Cluster, ErrorCode, Node, NodeId, PartitionResponse, ProduceRequest,
    ProduceResponse, ProducerConfig, ProducerError, Result, TopicPartition, Transport,
};
use tokio::sync::Notify;

/// How the mock answers requests without test intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRespond {
    Success,
    Error(ErrorCode),
    Disconnect,
}

#[derive(Default)]
struct MockState {
    sent: Vec<ProduceRequest>,
    responses: VecDeque<ClientResponse>,
    not_ready: HashMap<NodeId, Duration>,
    auto: Option<AutoRespond>,
    fail_send: bool,
    closed: bool,
    next_offsets: HashMap<TopicPartition, u64>,
    answered: HashSet<u32>,
}

impl MockState {
    fn success_for(&mut self, request: &ProduceRequest) -> ClientResponse {
        let partitions = request
            .partitions
            .iter()
            .map(|p| {
                let next = self.next_offsets.entry(p.topic_partition.clone()).or_insert(0);
                let base_offset = *next;
                *next += u64::from(p.record_count);
                PartitionResponse {
                    topic_partition: p.topic_partition.clone(),
                    error: ErrorCode::None,
                    base_offset,
                }
            })
            .collect();
        body_response(request, partitions)
    }
}

fn body_response(request: &ProduceRequest, partitions: Vec<PartitionResponse>) -> ClientResponse {
    ClientResponse {
        correlation_id: request.correlation_id,
        destination: request.destination,
        disconnected: false,
        body: Some(ProduceResponse { partitions }),
    }
}

fn error_response(request: &ProduceRequest, code: ErrorCode) -> ClientResponse {
    let partitions = request
        .partitions
        .iter()
        .map(|p| PartitionResponse {
            topic_partition: p.topic_partition.clone(),
            error: code,
            base_offset: 0,
        })
        .collect();
    body_response(request, partitions)
}

struct Shared {
    state: Mutex<MockState>,
    arrived: Notify,
}

/// Transport half, handed to the send loop.
pub struct MockTransport {
    shared: Arc<Shared>,
}

/// Test half, used to inspect and script the transport.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

pub fn mock_transport() -> (MockTransport, MockHandle) {
    let shared = Arc::new(Shared {
        state: Mutex::new(MockState::default()),
        arrived: Notify::new(),
    });
    (
        MockTransport {
            shared: Arc::clone(&shared),
        },
        MockHandle { shared },
    )
}

#[async_trait]
impl Transport for MockTransport {
    fn is_ready(&mut self, node: &Node, _now: Instant) -> bool {
        !self.shared.state.lock().not_ready.contains_key(&node.id)
    }

    fn connection_delay(&self, node: &Node, _now: Instant) -> Duration {
        self.shared
            .state
            .lock()
            .not_ready
            .get(&node.id)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn send(&mut self, request: ProduceRequest, _now: Instant) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.fail_send {
            return Err(ProducerError::Network("connection refused".into()));
        }

        let response = if !request.expects_response() {
            Some(ClientResponse {
                correlation_id: request.correlation_id,
                destination: request.destination,
                disconnected: false,
                body: None,
            })
        } else {
            match state.auto {
                Some(AutoRespond::Success) => Some(state.success_for(&request)),
                Some(AutoRespond::Error(code)) => Some(error_response(&request, code)),
                Some(AutoRespond::Disconnect) => Some(ClientResponse::disconnected(
                    request.correlation_id,
                    request.destination,
                )),
                None => None,
            }
        };
        if let Some(response) = response {
            state.answered.insert(request.correlation_id);
            state.responses.push_back(response);
        }
        state.sent.push(request);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration, _now: Instant) -> Result<Vec<ClientResponse>> {
        let arrived = self.shared.arrived.notified();
        tokio::pin!(arrived);
        arrived.as_mut().enable();

        if self.shared.state.lock().responses.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = arrived => {}
            }
        }
        Ok(self.shared.state.lock().responses.drain(..).collect())
    }

    fn in_flight_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.sent.len() - state.answered.len()
    }

    async fn close(&mut self) {
        self.shared.state.lock().closed = true;
    }
}

impl MockHandle {
    pub fn sent(&self) -> Vec<ProduceRequest> {
        self.shared.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.shared.state.lock().sent.len()
    }

    pub fn last_sent(&self) -> ProduceRequest {
        self.shared
            .state
            .lock()
            .sent
            .last()
            .cloned()
            .expect("nothing sent")
    }

    pub fn set_auto(&self, auto: Option<AutoRespond>) {
        self.shared.state.lock().auto = auto;
    }

    pub fn set_not_ready(&self, node: u32, delay: Duration) {
        self.shared.state.lock().not_ready.insert(NodeId(node), delay);
    }

    pub fn set_ready(&self, node: u32) {
        self.shared.state.lock().not_ready.remove(&NodeId(node));
    }

    pub fn fail_sends(&self, fail: bool) {
        self.shared.state.lock().fail_send = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Answer request `correlation_id` with success for every partition.
    pub fn respond_success(&self, correlation_id: u32) {
        self.respond_with(correlation_id, |state, request| state.success_for(request));
    }

    /// Answer request `correlation_id` with `code` for every partition.
    pub fn respond_error(&self, correlation_id: u32, code: ErrorCode) {
        self.respond_with(correlation_id, |_, request| error_response(request, code));
    }

    /// Answer request `correlation_id` with an explicit partition list.
    pub fn respond_partitions(&self, correlation_id: u32, partitions: Vec<PartitionResponse>) {
        self.respond_with(correlation_id, |_, request| body_response(request, partitions));
    }

    pub fn disconnect(&self, correlation_id: u32) {
        self.respond_with(correlation_id, |_, request| {
            ClientResponse::disconnected(request.correlation_id, request.destination)
        });
    }

    /// Queue a raw response.
    pub fn push_response(&self, response: ClientResponse) {
        self.shared.state.lock().responses.push_back(response);
        self.shared.arrived.notify_one();
    }

    fn respond_with(
        &self,
        correlation_id: u32,
        build: impl FnOnce(&mut MockState, &ProduceRequest) -> ClientResponse,
    ) {
        {
            let mut state = self.shared.state.lock();
            let request = state
                .sent
                .iter()
                .find(|r| r.correlation_id == correlation_id)
                .cloned()
                .expect("no such request");
            let response = build(&mut state, &request);
            state.answered.insert(correlation_id);
            state.responses.push_back(response);
        }
        self.shared.arrived.notify_one();
    }

    /// Wait until at least `count` requests have been sent.
    pub async fn wait_for_sent(&self, count: usize) {
        for _ in 0..10_000 {
            if self.sent_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} requests, saw {}", count, self.sent_count());
    }
}

/// `orders` with 2 partitions on nodes 1 and 2, `events` with 1 partition on node 1.
pub fn two_node_cluster() -> Cluster {
    Cluster::builder()
        .node(Node::new(1, "broker-1:9092"))
        .node(Node::new(2, "broker-2:9092"))
        .topic("orders", &[1, 2])
        .topic("events", &[1])
        .build()
}

pub fn test_config() -> ProducerConfig {
    ProducerConfig {
        client_id: "test-producer".into(),
        batch_size: 1024,
        buffer_memory: 64 * 1024,
        linger_ms: 0,
        max_block_ms: 1000,
        request_timeout_ms: 30_000,
        retries: 3,
        retry_backoff_ms: 100,
        acks: Acks::Leader,
        ..Default::default()
    }
}

/// Log to the test writer when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The send loop reads time through Tokio, so tests share its clock.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
