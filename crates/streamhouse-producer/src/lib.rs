//! StreamHouse Producer - batching record delivery engine
//!
//! This crate implements the client-side delivery path of a partitioned log:
//! records are appended into per-partition batches drawn from a bounded
//! buffer pool, and a background send loop groups ready batches by leader,
//! sends them, and retries or expires them until every record has an outcome.
//!
//! # Components
//!
//! - [`BufferPool`]: bounded memory with FIFO waiters
//! - [`RecordAccumulator`]: per-partition batch queues, readiness and draining
//! - [`Sender`]: the send loop, retries, expiry and shutdown
//! - [`Producer`]: the user-facing facade
//!
//! The network and the metadata source are injected through the
//! [`Transport`] and [`MetadataProvider`] traits.
//!
//! # Examples
//!
//! ```ignore
//! use streamhouse_producer::{Producer, ProducerRecord, StaticMetadata};
//!
//! let producer = Producer::builder()
//!     .metadata(Arc::new(StaticMetadata::new(cluster)))
//!     .transport(transport)
//!     .build()?;
//!
//! let offset = producer
//!     .send(ProducerRecord::new("orders", "order data").with_key("user123"), None)
//!     .await?
//!     .await?
//!     .offset;
//!
//! producer.close(true).await?;
//! ```

pub mod accumulator;
pub mod batch;
mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod producer;
pub mod records;
pub mod retry;
pub mod sender;
pub mod transport;

pub use accumulator::{ReadyCheckResult, RecordAccumulator, RecordAppendResult};
pub use batch::{Callback, ProducerBatch, RecordFuture, RecordMetadata};
pub use cluster::{Cluster, MetadataProvider, Node, NodeId, StaticMetadata, TopicPartition};
pub use config::{Acks, ProducerConfig};
pub use error::{ProducerError, Result};
pub use metrics::{MetricsSink, NoopMetrics, ProducerStats, ProducerStatsSnapshot};
pub use pool::BufferPool;
pub use producer::{partition_for_key, Producer, ProducerBuilder, ProducerRecord};
pub use retry::{ExpiryPolicy, RetryPolicy};
pub use sender::{Sender, SenderControl, SenderState};
pub use transport::{
    ClientResponse, ErrorCode, PartitionData, PartitionResponse, ProduceRequest, ProduceResponse,
    Transport,
};
