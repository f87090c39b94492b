//! Collaborator interfaces
//!
//! The WAL core does not own the time-series storage engine, the cluster
//! state or the metric wire format. It reaches them only through these
//! traits, implemented by the embedding server (and by in-memory doubles in
//! [`crate::testing`]).

use crate::Result;
use crate::types::{BrokerRow, Node, NodeId, PartitionKey, ShardAssignment, ShardId};

/// Callback invoked with the node whose state changed
pub type NodeStateCallback = Box<dyn Fn(NodeId) + Send + Sync>;

/// Write path of the local time-series storage engine
pub trait StorageEngine: Send + Sync {
    /// Resolve and attach metric metadata to `rows` in place
    fn lookup_metric_meta(&self, rows: &mut [BrokerRow]) -> Result<()>;

    /// Persist rows
    fn write(&self, rows: &[BrokerRow]) -> Result<()>;

    /// Last WAL sequence committed for the log identified by `key`,
    /// `-1` when nothing was committed yet
    fn committed_seq(&self, key: &PartitionKey) -> i64;

    /// Record that every sequence up to `seq` of `key` was applied
    fn commit_seq(&self, key: &PartitionKey, seq: i64);
}

/// Cluster state as seen by this node
pub trait StateManager: Send + Sync {
    /// Address of `node` if it is currently online
    fn get_live_node(&self, node: NodeId) -> Option<Node>;

    /// Register `callback` to be called whenever `node` changes state
    fn watch_node_state_change(&self, node: NodeId, callback: NodeStateCallback);

    /// Leader and replicas of a shard
    fn shard_assignment(&self, database: &str, shard: ShardId) -> Option<ShardAssignment>;
}

/// Converts a metric in wire format `M` into a broker row
pub trait MetricConverter<M>: Send + Sync {
    /// Convert one metric
    fn convert_to(&self, metric: &M) -> Result<BrokerRow>;
}
