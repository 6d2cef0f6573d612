//! Cluster view consumed by the accumulator and the send loop.
//!
//! Discovery of brokers and partition leaders is owned by an external
//! metadata collaborator. The producer only needs a point-in-time snapshot
//! (`Cluster`) mapping each partition to the node that currently leads it,
//! plus a way to ask for a refresh when that snapshot turns out to be stale.
//!
//! ```text
//! ┌────────────────────┐  fetch()          ┌─────────────┐
//! │  MetadataProvider  │ ────────────────▶ │   Cluster   │
//! │                    │                   │  tp → node  │
//! │  request_update()  │ ◀──── Sender ──── │  node → tps │
//! └────────────────────┘                   └─────────────┘
//! ```

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a destination queue: a (topic, partition) pair.
///
/// Ordered by topic then partition so iteration over partition queues is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Broker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A broker that can lead partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
}

impl Node {
    pub fn new(id: u32, address: impl Into<String>) -> Self {
        Self {
            id: NodeId(id),
            address: address.into(),
        }
    }
}

/// Immutable snapshot of partition leadership.
///
/// # Examples
///
/// ```ignore
/// let cluster = Cluster::builder()
///     .node(Node::new(1, "broker-1:9092"))
///     .topic("orders", &[1, 1, 2])   // partition i is led by the i-th node id
///     .build();
///
/// assert_eq!(cluster.partitions_for_node(NodeId(1)).len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    nodes: BTreeMap<NodeId, Node>,
    leaders: BTreeMap<TopicPartition, NodeId>,
    partitions_by_node: BTreeMap<NodeId, Vec<TopicPartition>>,
    partition_counts: HashMap<String, u32>,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    /// An empty cluster: no nodes, no known partitions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The node currently leading `tp`, if known and registered.
    pub fn leader_for(&self, tp: &TopicPartition) -> Option<&Node> {
        self.leaders.get(tp).and_then(|id| self.nodes.get(id))
    }

    /// Partitions led by `node`, sorted by (topic, partition).
    pub fn partitions_for_node(&self, node: NodeId) -> &[TopicPartition] {
        self.partitions_by_node
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Number of partitions of `topic`, including leaderless ones.
    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        self.partition_counts.get(topic).copied()
    }
}

/// Builder for [`Cluster`].
#[derive(Debug, Default)]
pub struct ClusterBuilder {
    nodes: BTreeMap<NodeId, Node>,
    leaders: BTreeMap<TopicPartition, NodeId>,
    partition_counts: HashMap<String, u32>,
}

impl ClusterBuilder {
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id, node);
        self
    }

    /// Register a topic; `leaders[i]` is the node id leading partition `i`.
    pub fn topic(mut self, topic: &str, leaders: &[u32]) -> Self {
        for (partition, leader) in leaders.iter().enumerate() {
            self.leaders
                .insert(TopicPartition::new(topic, partition as u32), NodeId(*leader));
        }
        self.partition_counts
            .insert(topic.to_string(), leaders.len() as u32);
        self
    }

    /// Register a topic whose partitions currently have no leader.
    pub fn leaderless_topic(mut self, topic: &str, partition_count: u32) -> Self {
        self.partition_counts
            .insert(topic.to_string(), partition_count);
        self
    }

    pub fn build(self) -> Cluster {
        let mut partitions_by_node: BTreeMap<NodeId, Vec<TopicPartition>> = BTreeMap::new();
        // BTreeMap iteration keeps each node's list sorted.
        for (tp, leader) in &self.leaders {
            if self.nodes.contains_key(leader) {
                partitions_by_node
                    .entry(*leader)
                    .or_default()
                    .push(tp.clone());
            }
        }
        Cluster {
            nodes: self.nodes,
            leaders: self.leaders,
            partitions_by_node,
            partition_counts: self.partition_counts,
        }
    }
}

/// Source of cluster metadata.
///
/// Implementations own discovery; the producer only reads snapshots and
/// signals when it saw a partition without a usable leader.
pub trait MetadataProvider: Send + Sync {
    /// Current snapshot. Cheap; called once per send-loop iteration.
    fn fetch(&self) -> Arc<Cluster>;

    /// Ask the provider to refresh metadata at its earliest opportunity.
    fn request_update(&self);
}

/// A [`MetadataProvider`] backed by a snapshot that is replaced explicitly.
///
/// Useful for embedding the producer behind a discovery mechanism that pushes
/// updates, and for tests.
#[derive(Debug)]
pub struct StaticMetadata {
    cluster: RwLock<Arc<Cluster>>,
    update_requests: AtomicU64,
}

impl StaticMetadata {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster: RwLock::new(Arc::new(cluster)),
            update_requests: AtomicU64::new(0),
        }
    }

    /// Replace the current snapshot.
    pub fn update(&self, cluster: Cluster) {
        *self.cluster.write() = Arc::new(cluster);
    }

    /// How many times a refresh has been requested.
    pub fn update_requests(&self) -> u64 {
        self.update_requests.load(Ordering::Relaxed)
    }
}

impl MetadataProvider for StaticMetadata {
    fn fetch(&self) -> Arc<Cluster> {
        Arc::clone(&self.cluster.read())
    }

    fn request_update(&self) {
        self.update_requests.fetch_add(1, Ordering::Relaxed);
    }
}
