//! Write-ahead log partitions and their manager
//!
//! A [`Partition`] is the WAL of one (database, shard, family, leader). It
//! wraps a [`crate::queue::FanOutQueue`] and owns one replicator peer per
//! follower. The [`WalManager`] keeps the registry of partitions, recovers
//! them from disk, serves the follower-side RPCs and garbage-collects
//! drained partitions.
//!
//! ```text
//! <dir>/<database>/<shard>/<family_time>/<leader>/
//!     queue.meta  segment/  consumer_group/<follower>/meta
//! ```

pub mod manager;
pub mod partition;

pub use manager::WalManager;
pub use partition::Partition;

use crate::collab::{StateManager, StorageEngine};
use crate::config::WalConfig;
use crate::metrics::{PartitionStats, QueueStats, ReplicatorStats};
use crate::replication::transport::RpcTransport;
use crate::types::NodeId;
use std::sync::Arc;

/// Collaborators and statistics shared by every partition of a manager
#[derive(Clone)]
pub struct WalContext {
    /// This node
    pub current_node: NodeId,
    /// Configuration
    pub config: Arc<WalConfig>,
    /// Local storage engine
    pub storage: Arc<dyn StorageEngine>,
    /// Cluster state
    pub state_manager: Arc<dyn StateManager>,
    /// Node-to-node transport
    pub transport: Arc<dyn RpcTransport>,
    /// Queue statistics
    pub queue_stats: Arc<QueueStats>,
    /// Partition statistics
    pub partition_stats: Arc<PartitionStats>,
    /// Replicator statistics
    pub replicator_stats: Arc<ReplicatorStats>,
}

impl WalContext {
    /// Context with fresh statistics handles
    pub fn new(
        current_node: NodeId,
        config: WalConfig,
        storage: Arc<dyn StorageEngine>,
        state_manager: Arc<dyn StateManager>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        Self {
            current_node,
            config: Arc::new(config),
            storage,
            state_manager,
            transport,
            queue_stats: Arc::new(QueueStats::default()),
            partition_stats: Arc::new(PartitionStats::default()),
            replicator_stats: Arc::new(ReplicatorStats::default()),
        }
    }
}

impl std::fmt::Debug for WalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalContext")
            .field("current_node", &self.current_node)
            .field("dir", &self.config.dir)
            .finish()
    }
}
