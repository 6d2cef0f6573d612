//! Transport seam between the send loop and the network.
//!
//! The send loop never touches sockets. It hands fully grouped
//! [`ProduceRequest`]s to a [`Transport`] and later collects
//! [`ClientResponse`]s from it. Connection management, framing and
//! authentication are the transport's business.
//!
//! ## Contract
//!
//! - `is_ready` may start connecting as a side effect; a `false` answer is
//!   paired with `connection_delay` telling the loop how long to wait.
//! - Every request accepted by `send` yields exactly one response from
//!   `poll`, either with a body, without one (acks = 0), or marked
//!   `disconnected`.
//! - `poll` must be cancel-safe: the loop races it against its wakeup signal
//!   and drops the future when woken early. A dropped poll must not lose
//!   responses.

use crate::cluster::{Node, NodeId, TopicPartition};
use crate::config::Acks;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Per-partition error codes returned by a broker.
///
/// Numeric values follow the Kafka produce protocol so a codec can map them
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None,
    Unknown,
    OffsetOutOfRange,
    CorruptMessage,
    UnknownTopicOrPartition,
    LeaderNotAvailable,
    NotLeaderForPartition,
    RequestTimedOut,
    MessageTooLarge,
    NetworkException,
    InvalidTopic,
    RecordListTooLarge,
    NotEnoughReplicas,
    NotEnoughReplicasAfterAppend,
    InvalidRequiredAcks,
    TopicAuthorizationFailed,
    ClusterAuthorizationFailed,
}

impl ErrorCode {
    /// Decode a wire error code. Unrecognized codes map to `Unknown`.
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::OffsetOutOfRange,
            2 => ErrorCode::CorruptMessage,
            3 => ErrorCode::UnknownTopicOrPartition,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            10 => ErrorCode::MessageTooLarge,
            13 => ErrorCode::NetworkException,
            17 => ErrorCode::InvalidTopic,
            18 => ErrorCode::RecordListTooLarge,
            19 => ErrorCode::NotEnoughReplicas,
            20 => ErrorCode::NotEnoughReplicasAfterAppend,
            21 => ErrorCode::InvalidRequiredAcks,
            29 => ErrorCode::TopicAuthorizationFailed,
            31 => ErrorCode::ClusterAuthorizationFailed,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            ErrorCode::Unknown => -1,
            ErrorCode::None => 0,
            ErrorCode::OffsetOutOfRange => 1,
            ErrorCode::CorruptMessage => 2,
            ErrorCode::UnknownTopicOrPartition => 3,
            ErrorCode::LeaderNotAvailable => 5,
            ErrorCode::NotLeaderForPartition => 6,
            ErrorCode::RequestTimedOut => 7,
            ErrorCode::MessageTooLarge => 10,
            ErrorCode::NetworkException => 13,
            ErrorCode::InvalidTopic => 17,
            ErrorCode::RecordListTooLarge => 18,
            ErrorCode::NotEnoughReplicas => 19,
            ErrorCode::NotEnoughReplicasAfterAppend => 20,
            ErrorCode::InvalidRequiredAcks => 21,
            ErrorCode::TopicAuthorizationFailed => 29,
            ErrorCode::ClusterAuthorizationFailed => 31,
        }
    }

    /// Transient conditions that may succeed when the batch is resent.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::CorruptMessage
                | ErrorCode::UnknownTopicOrPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderForPartition
                | ErrorCode::RequestTimedOut
                | ErrorCode::NetworkException
                | ErrorCode::NotEnoughReplicas
                | ErrorCode::NotEnoughReplicasAfterAppend
        )
    }

    /// Errors that mean our view of partition leadership is stale.
    pub fn is_invalid_metadata(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTopicOrPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderForPartition
                | ErrorCode::NetworkException
        )
    }
}

/// Records for one partition inside a produce request.
#[derive(Debug, Clone)]
pub struct PartitionData {
    pub topic_partition: TopicPartition,
    pub record_count: u32,
    pub records: Bytes,
}

/// One outbound request carrying every batch drained for a destination.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub correlation_id: u32,
    pub destination: NodeId,
    pub acks: Acks,
    pub timeout: Duration,
    pub partitions: Vec<PartitionData>,
}

impl ProduceRequest {
    /// Whether the destination will answer with a body. Only `acks=0`
    /// requests go unanswered.
    pub fn expects_response(&self) -> bool {
        self.acks.as_i16() != 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.partitions.iter().map(|p| p.records.len()).sum()
    }
}

/// Outcome for one partition of a produce request.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResponse {
    pub topic_partition: TopicPartition,
    pub error: ErrorCode,
    pub base_offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceResponse {
    pub partitions: Vec<PartitionResponse>,
}

/// A completed request, as surfaced by [`Transport::poll`].
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub correlation_id: u32,
    pub destination: NodeId,
    /// The connection dropped before a response arrived.
    pub disconnected: bool,
    /// `None` for fire-and-forget requests and for disconnects.
    pub body: Option<ProduceResponse>,
}

impl ClientResponse {
    pub fn disconnected(correlation_id: u32, destination: NodeId) -> Self {
        Self {
            correlation_id,
            destination,
            disconnected: true,
            body: None,
        }
    }
}

/// Network client driven by the send loop.
///
/// Implementations are owned exclusively by the send loop task, hence
/// `&mut self` everywhere and no `Sync` bound.
#[async_trait]
pub trait Transport: Send {
    /// Whether a request can be sent to `node` right now.
    fn is_ready(&mut self, node: &Node, now: Instant) -> bool;

    /// How long until `node` may become ready. Zero when already connected.
    fn connection_delay(&self, node: &Node, now: Instant) -> Duration;

    /// Queue a request for transmission.
    fn send(&mut self, request: ProduceRequest, now: Instant) -> Result<()>;

    /// Wait up to `timeout` for completed requests.
    async fn poll(&mut self, timeout: Duration, now: Instant) -> Result<Vec<ClientResponse>>;

    /// Requests sent and not yet surfaced by `poll`.
    fn in_flight_count(&self) -> usize;

    /// Release connections. Called once when the send loop exits.
    async fn close(&mut self);
}
