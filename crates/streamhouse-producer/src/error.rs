//! Error types for StreamHouse producer operations.
//!
//! This module defines every outcome a producer caller can observe. Errors are
//! grouped by where they surface:
//!
//! ## Error Handling Strategy
//!
//! - **Capacity errors** (returned synchronously from `append`/`send`):
//!   `BufferExhausted`, `Closed`, `RecordTooLarge`
//! - **Transient send errors** (retried by the send loop until the retry limit):
//!   `Network`, retriable `Broker` codes
//! - **Terminal send errors** (delivered through the per-record callback):
//!   `TopicAuthorizationFailed`, non-retriable `Broker` codes, `BatchExpired`,
//!   `ForcedClose`
//! - **Client errors**: `TopicNotFound`, `InvalidPartition`, `ConfigError`
//!
//! Every variant is `Clone`: a batch has a single terminal outcome which is
//! handed to each record that was appended to it.
//!
//! ## Examples
//!
//! ```ignore
//! use streamhouse_producer::{Producer, ProducerError, ProducerRecord};
//!
//! match producer.send(ProducerRecord::new("orders", b"data".to_vec()), None).await {
//!     Ok(pending) => println!("queued at relative offset {}", pending.relative_offset()),
//!     Err(ProducerError::BufferExhausted(waited)) => {
//!         eprintln!("producer buffer still full after {:?}", waited);
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use crate::cluster::TopicPartition;
use crate::transport::ErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ProducerError>`.
pub type Result<T> = std::result::Result<T, ProducerError>;

/// Comprehensive error type for StreamHouse producer operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProducerError {
    /// The buffer pool could not provide memory within the allowed blocking time.
    ///
    /// ## Causes
    /// - Producers outpace the network and `buffer_memory` is exhausted
    /// - A destination has been unreachable long enough for batches to pile up
    ///
    /// ## Resolution
    /// - Increase `buffer_memory` or `max_block_ms`
    /// - Slow down the producing side
    #[error("Failed to allocate memory within the configured max blocking time {0:?}")]
    BufferExhausted(Duration),

    /// The producer (or its accumulator) has been closed; no further appends are accepted.
    #[error("Cannot send after the producer is closed")]
    Closed,

    /// The producer was closed without draining; the record was never sent.
    #[error("Producer is closed forcefully")]
    ForcedClose,

    /// The batch sat unacknowledged for longer than the expiry window.
    ///
    /// This usually means the leader for the partition has been unknown or
    /// unreachable for longer than the request timeout.
    #[error("Batch for {0} expired before it could be sent")]
    BatchExpired(TopicPartition),

    /// The connection to the destination dropped while the request was in flight.
    #[error("Network error: {0}")]
    Network(String),

    /// The destination returned an error code for this partition.
    #[error("Broker returned {1:?} for {0}")]
    Broker(TopicPartition, ErrorCode),

    /// The client is not authorized to write to the topic.
    #[error("Not authorized to access topic '{0}'")]
    TopicAuthorizationFailed(String),

    /// A single record is larger than the producer can ever send.
    ///
    /// Contains the serialized record size and the limit it exceeded.
    #[error("Record of {0} bytes exceeds the maximum of {1} bytes")]
    RecordTooLarge(usize, usize),

    /// Topic is not present in the current cluster metadata.
    #[error("Topic '{0}' does not exist")]
    TopicNotFound(String),

    /// Partition ID is out of range for the topic.
    #[error("Partition {0} does not exist for topic '{1}' (max: {2})")]
    InvalidPartition(u32, String, u32),

    /// Invalid producer configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProducerError {
    /// Whether the send loop may retry a batch that failed with this error.
    ///
    /// Only transient send errors qualify. Capacity and client errors are
    /// surfaced to the caller directly and never reach the retry path.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProducerError::Network(_) => true,
            ProducerError::Broker(_, code) => code.is_retriable(),
            _ => false,
        }
    }

    /// Translate a broker error code for a partition into the error delivered to callbacks.
    pub fn from_broker(topic_partition: &TopicPartition, code: ErrorCode) -> Self {
        match code {
            ErrorCode::TopicAuthorizationFailed => {
                ProducerError::TopicAuthorizationFailed(topic_partition.topic().to_string())
            }
            ErrorCode::NetworkException => {
                ProducerError::Network(format!("disconnected while sending to {}", topic_partition))
            }
            other => ProducerError::Broker(topic_partition.clone(), other),
        }
    }
}
