//! One WAL partition: a fan-out queue plus its replicator peers

use crate::metrics;
use crate::queue::FanOutQueue;
use crate::replication::peer::ReplicatorPeer;
use crate::replication::replicator::{LocalReplicator, RemoteReplicator, Replicator};
use crate::types::{NodeId, PartitionKey};
use crate::wal::WalContext;
use crate::{Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type PeerMap = HashMap<NodeId, Arc<ReplicatorPeer>>;

/// WAL of one (database, shard, family, leader)
pub struct Partition {
    key: PartitionKey,
    dir: PathBuf,
    ctx: WalContext,
    fanout: Arc<FanOutQueue>,
    peers: ArcSwap<PeerMap>,
    peer_lock: Mutex<()>,
    replica_lock: Mutex<()>,
    span: tracing::Span,
    closed: AtomicBool,
}

impl Partition {
    /// Open or create the partition stored in `dir`. Replicator peers are
    /// not started; see [`recover_replicas`](Self::recover_replicas).
    pub fn open(key: PartitionKey, dir: impl AsRef<Path>, ctx: WalContext) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let fanout = Arc::new(FanOutQueue::open(
            &dir,
            ctx.config.queue.clone(),
            ctx.queue_stats.clone(),
        )?);
        let span = tracing::info_span!(
            "partition",
            database = %key.database,
            shard = %key.shard_id,
            family_time = key.family_time,
            leader = %key.leader,
        );

        Ok(Self {
            key,
            dir,
            ctx,
            fanout,
            peers: ArcSwap::from_pointee(PeerMap::new()),
            peer_lock: Mutex::new(()),
            replica_lock: Mutex::new(()),
            span,
            closed: AtomicBool::new(false),
        })
    }

    /// Partition key
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Underlying queue
    pub fn fanout(&self) -> &Arc<FanOutQueue> {
        &self.fanout
    }

    /// Span carrying the partition key
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Leader write path: append a compressed chunk
    pub fn write_log(&self, data: &[u8]) -> Result<i64> {
        let _entered = self.span.enter();
        match self.fanout.put(data) {
            Ok(seq) => {
                metrics::incr(&self.ctx.partition_stats.write_logs);
                Ok(seq)
            }
            Err(e) => {
                metrics::incr(&self.ctx.partition_stats.write_failures);
                tracing::warn!(size = data.len(), "write log failed: {}", e);
                Err(e)
            }
        }
    }

    /// Follower write path: append `data` only if `proposed` is the next
    /// sequence this log assigns.
    ///
    /// Returns `proposed` when applied, otherwise the unchanged next sequence
    /// the leader has to resend from.
    pub fn replica_log(&self, proposed: i64, data: &[u8]) -> Result<i64> {
        let _entered = self.span.enter();
        let _guard = self.replica_lock.lock();

        let head = self.fanout.queue().head_seq();
        if proposed != head {
            metrics::incr(&self.ctx.partition_stats.replica_mismatches);
            tracing::debug!(proposed, head, "rejecting replica with unexpected sequence");
            return Ok(head);
        }

        match self.fanout.put(data) {
            Ok(seq) => {
                debug_assert_eq!(seq, proposed);
                metrics::incr(&self.ctx.partition_stats.replica_logs);
                Ok(seq)
            }
            Err(e) => {
                metrics::incr(&self.ctx.partition_stats.replica_failures);
                tracing::warn!(proposed, "replica log failed: {}", e);
                Err(e)
            }
        }
    }

    /// Last sequence this follower holds
    pub fn replica_ack_index(&self) -> i64 {
        self.fanout.queue().appended_seq()
    }

    /// Continue appending at `append_index`, discarding the current log
    pub fn reset_replica_index(&self, append_index: i64) -> Result<()> {
        let _entered = self.span.enter();
        let _guard = self.replica_lock.lock();
        self.fanout.set_appended_seq(append_index - 1)?;
        metrics::incr(&self.ctx.partition_stats.index_resets);
        tracing::info!(append_index, "reset replica append index");
        Ok(())
    }

    /// Start a replicator for every follower of this leader's log. Edges that
    /// already run are left alone.
    pub fn build_replica_for_leader(&self, leader: NodeId, followers: &[NodeId]) -> Result<()> {
        self.check_leader(leader)?;
        for &follower in followers {
            self.ensure_peer(follower)?;
        }
        Ok(())
    }

    /// Start this node's local replicator for a log received from `leader`
    pub fn build_replica_for_follower(&self, leader: NodeId, follower: NodeId) -> Result<()> {
        self.check_leader(leader)?;
        if follower != self.ctx.current_node {
            return Err(Error::replication(format!(
                "node {} cannot build follower replica for {}",
                self.ctx.current_node, follower
            )));
        }
        self.ensure_peer(follower)
    }

    /// Restart replicators for every consumer group found on disk
    pub fn recover_replicas(&self) -> Result<()> {
        for name in self.fanout.consumer_group_names() {
            match name.parse::<NodeId>() {
                Ok(follower) => self.ensure_peer(follower)?,
                Err(_) => {
                    tracing::warn!(parent: &self.span, group = %name, "ignoring consumer group without node id");
                }
            }
        }
        Ok(())
    }

    fn check_leader(&self, leader: NodeId) -> Result<()> {
        if leader != self.key.leader {
            return Err(Error::replication(format!(
                "partition {} is led by {}, not {}",
                self.key, self.key.leader, leader
            )));
        }
        Ok(())
    }

    fn ensure_peer(&self, follower: NodeId) -> Result<()> {
        if self.peers.load().contains_key(&follower) {
            return Ok(());
        }

        let _guard = self.peer_lock.lock();
        let current = self.peers.load_full();
        if current.contains_key(&follower) {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!("partition {}", self.key)));
        }

        let replicator = self.new_replicator(follower)?;
        let peer = Arc::new(ReplicatorPeer::new(replicator));
        let span = tracing::info_span!(parent: &self.span, "replicator", follower = %follower);
        peer.start(self.ctx.config.replica_idle, span);

        let mut next = PeerMap::clone(&current);
        next.insert(follower, peer);
        self.peers.store(Arc::new(next));

        tracing::info!(parent: &self.span, %follower, "started replicator peer");
        Ok(())
    }

    fn new_replicator(&self, follower: NodeId) -> Result<Arc<dyn Replicator>> {
        if follower == self.ctx.current_node {
            return Ok(Arc::new(LocalReplicator::new(
                self.key.clone(),
                follower,
                self.fanout.clone(),
                self.ctx.storage.clone(),
                self.ctx.replicator_stats.clone(),
            )?));
        }
        Ok(Arc::new(RemoteReplicator::new(
            self.key.clone(),
            follower,
            self.fanout.clone(),
            self.ctx.transport.clone(),
            self.ctx.state_manager.clone(),
            self.ctx.replicator_stats.clone(),
            self.ctx.config.node_wait_timeout,
            self.ctx.config.rpc_timeout,
        )?))
    }

    /// Followers with a running peer, sorted
    pub fn followers(&self) -> Vec<NodeId> {
        let mut followers: Vec<NodeId> = self.peers.load().keys().copied().collect();
        followers.sort();
        followers
    }

    /// Peer replicating to `follower`
    pub fn peer(&self, follower: NodeId) -> Option<Arc<ReplicatorPeer>> {
        self.peers.load().get(&follower).cloned()
    }

    /// Apply the minimum-ack floor to the queue
    pub fn sync(&self) {
        self.fanout.sync();
    }

    /// Flush queue and group metadata
    pub fn flush(&self) -> Result<()> {
        self.fanout.flush()
    }

    /// Whether every follower acknowledged everything appended
    pub fn is_drained(&self) -> bool {
        self.fanout.is_empty()
    }

    /// Whether the family ended more than `ttl` before `now` (epoch ms)
    pub fn is_expired(&self, now: i64, ttl: Duration) -> bool {
        self.key.family_time.saturating_add(ttl.as_millis() as i64) < now
    }

    /// Stop all peers, waiting for each, then close the queue. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let peers = {
            let _guard = self.peer_lock.lock();
            self.peers.swap(Arc::new(PeerMap::new()))
        };
        for peer in peers.values() {
            peer.shutdown().await;
        }

        tracing::info!(parent: &self.span, "closed partition");
        self.fanout.close()
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("key", &self.key)
            .field("dir", &self.dir)
            .field("followers", &self.followers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, WalConfig};
    use crate::testing::{MemoryStorageEngine, RecordingTransport, StaticStateManager, TestContext};
    use crate::types::{SEQ_EMPTY, ShardId};

    const LEADER: NodeId = NodeId(1);
    const FOLLOWER: NodeId = NodeId(2);

    fn context(ctx: &TestContext, node: NodeId) -> WalContext {
        let mut config = WalConfig::new(ctx.path())
            .with_queue(
                QueueConfig::default()
                    .with_data_page_size(64 * 1024)
                    .with_max_message_size(1024),
            )
            .with_replica_idle(Duration::from_millis(10));
        config.node_wait_timeout = Duration::from_millis(20);
        WalContext::new(
            node,
            config,
            Arc::new(MemoryStorageEngine::new()),
            Arc::new(StaticStateManager::new()),
            Arc::new(RecordingTransport::new()),
        )
    }

    fn partition(ctx: &TestContext, node: NodeId) -> Partition {
        let key = PartitionKey::new("db", ShardId(0), 0, LEADER);
        Partition::open(key, ctx.path().join("p"), context(ctx, node)).unwrap()
    }

    #[tokio::test]
    async fn test_replica_log_applies_only_expected_sequence() {
        let ctx = TestContext::new();
        let partition = partition(&ctx, FOLLOWER);
        assert_eq!(partition.replica_ack_index(), SEQ_EMPTY);

        assert_eq!(partition.replica_log(0, b"a").unwrap(), 0);
        assert_eq!(partition.replica_log(1, b"b").unwrap(), 1);

        // Gap and duplicate are both rejected with the next expected index.
        assert_eq!(partition.replica_log(5, b"x").unwrap(), 2);
        assert_eq!(partition.replica_log(1, b"x").unwrap(), 2);
        assert_eq!(partition.replica_ack_index(), 1);
        assert_eq!(partition.fanout().queue().get(1).unwrap(), b"b");
        assert_eq!(partition.ctx.partition_stats.snapshot().replica_mismatches, 2);
    }

    #[tokio::test]
    async fn test_reset_replica_index() {
        let ctx = TestContext::new();
        let partition = partition(&ctx, FOLLOWER);
        partition.replica_log(0, b"a").unwrap();

        partition.reset_replica_index(9).unwrap();
        assert_eq!(partition.replica_ack_index(), 8);
        assert_eq!(partition.replica_log(9, b"z").unwrap(), 9);
    }

    #[tokio::test]
    async fn test_build_replicas_is_idempotent() {
        let ctx = TestContext::new();
        let partition = partition(&ctx, LEADER);

        partition.build_replica_for_leader(LEADER, &[LEADER, FOLLOWER]).unwrap();
        let first = partition.peer(FOLLOWER).unwrap();
        partition.build_replica_for_leader(LEADER, &[LEADER, FOLLOWER]).unwrap();
        assert!(Arc::ptr_eq(&first, &partition.peer(FOLLOWER).unwrap()));
        assert_eq!(partition.followers(), vec![LEADER, FOLLOWER]);
        assert_eq!(
            partition.fanout().consumer_group_names(),
            vec!["1".to_string(), "2".to_string()]
        );

        assert!(partition.build_replica_for_leader(NodeId(9), &[FOLLOWER]).is_err());
        assert!(partition.build_replica_for_follower(LEADER, NodeId(3)).is_err());

        partition.close().await.unwrap();
        partition.close().await.unwrap();
        assert!(!first.is_running());
        assert!(partition.followers().is_empty());
        assert!(partition.write_log(b"late").is_err());
    }

    #[tokio::test]
    async fn test_expiry_and_drain() {
        let ctx = TestContext::new();
        let partition = partition(&ctx, LEADER);
        assert!(partition.is_drained());
        assert!(partition.is_expired(10_001, Duration::from_secs(10)));
        assert!(!partition.is_expired(10_000, Duration::from_secs(10)));

        partition.fanout().get_or_create_consumer_group("2").unwrap();
        partition.write_log(b"pending").unwrap();
        assert!(!partition.is_drained());
    }
}
