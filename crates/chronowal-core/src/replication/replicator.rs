//! Replicators: deliver a partition's WAL entries to one target
//!
//! Every replicator is bound to the consumer group named after its follower.
//! The [`LocalReplicator`] applies entries to this node's storage engine; the
//! [`RemoteReplicator`] streams them to a follower after a readiness
//! handshake that reconciles both sides' offsets:
//!
//! ```text
//! required = group.consumed + 1      follower_ack = GetReplicaAckIndex()
//!
//! follower_ack + 1 == required        → Ready
//! follower_ack <  group.acknowledged  → ResetIndex(group.acknowledged + 1),
//!                                       rewind group to its ack
//! follower_ack >  queue.appended      → leader catches up to follower
//! otherwise                           → rewind group to follower_ack
//! ```

use crate::channel::chunk::decode_chunk;
use crate::collab::{StateManager, StorageEngine};
use crate::metrics::{self, ReplicatorStats};
use crate::queue::{ConsumerGroup, FanOutQueue};
use crate::replication::protocol::{IndexRequest, ReplicaState};
use crate::replication::transport::{ReplicaStream, RpcTransport, with_timeout};
use crate::types::{Node, NodeId, PartitionKey};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Replicator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Not yet reconciled with the target
    Init,
    /// Handshake done, entries can be delivered
    Ready,
    /// Last delivery failed, a new handshake is required
    Failure,
}

/// Delivers consumed entries of one consumer group to one target
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Shared channel state
    fn channel(&self) -> &ReplicatorChannel;

    /// Reconcile with the target if needed; true when entries can flow
    async fn is_ready(&self) -> bool;

    /// Deliver the entry at `seq`
    async fn replica(&self, seq: i64, data: &[u8]);

    /// Handle an entry that could not be read from the queue
    fn skip(&self, seq: i64, err: &Error);

    /// Release transport resources
    async fn close(&self) {}

    /// Current state
    fn state(&self) -> ReplicatorState {
        self.channel().state()
    }
}

/// State shared by both replicator variants
pub struct ReplicatorChannel {
    key: PartitionKey,
    follower: NodeId,
    fanout: Arc<FanOutQueue>,
    group: Arc<ConsumerGroup>,
    state: Mutex<ReplicatorState>,
    stats: Arc<ReplicatorStats>,
}

impl ReplicatorChannel {
    /// Bind to the consumer group of `follower` on `fanout`
    pub fn new(
        key: PartitionKey,
        follower: NodeId,
        fanout: Arc<FanOutQueue>,
        stats: Arc<ReplicatorStats>,
    ) -> Result<Self> {
        let group = fanout.get_or_create_consumer_group(&follower.to_string())?;
        Ok(Self {
            key,
            follower,
            fanout,
            group,
            state: Mutex::new(ReplicatorState::Init),
            stats,
        })
    }

    /// Partition replicated
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Leader of the partition
    pub fn leader(&self) -> NodeId {
        self.key.leader
    }

    /// Target node
    pub fn follower(&self) -> NodeId {
        self.follower
    }

    /// Bound consumer group
    pub fn consumer_group(&self) -> &Arc<ConsumerGroup> {
        &self.group
    }

    /// Statistics handle
    pub fn stats(&self) -> &Arc<ReplicatorStats> {
        &self.stats
    }

    /// Current state
    pub fn state(&self) -> ReplicatorState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ReplicatorState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(
                leader = %self.key.leader,
                follower = %self.follower,
                from = ?*current,
                to = ?state,
                "replicator state change"
            );
            *current = state;
        }
    }

    /// Entries not yet consumed
    pub fn pending(&self) -> i64 {
        self.group.pending()
    }

    /// Take the next entry, waiting up to `timeout` for one
    pub async fn consume_wait(&self, timeout: Duration) -> Option<i64> {
        self.group.consume_wait(timeout).await
    }

    /// Read the entry at `seq`
    pub fn message(&self, seq: i64) -> Result<Vec<u8>> {
        self.group.message(seq)
    }

    /// Rewind the group cursor to `seq` and acknowledge everything up to it
    fn rewind_to(&self, seq: i64) -> Result<()> {
        self.group.set_consumed_seq(seq)?;
        if seq > self.group.acknowledged_seq() {
            self.group.ack(seq);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReplicatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorChannel")
            .field("key", &self.key)
            .field("follower", &self.follower)
            .field("state", &self.state())
            .finish()
    }
}

/// Applies entries to the local storage engine
pub struct LocalReplicator {
    channel: ReplicatorChannel,
    storage: Arc<dyn StorageEngine>,
    last_seq: AtomicI64,
}

impl LocalReplicator {
    /// Create a local replicator for `follower` (this node)
    pub fn new(
        key: PartitionKey,
        follower: NodeId,
        fanout: Arc<FanOutQueue>,
        storage: Arc<dyn StorageEngine>,
        stats: Arc<ReplicatorStats>,
    ) -> Result<Self> {
        let channel = ReplicatorChannel::new(key, follower, fanout, stats)?;
        let last_seq = AtomicI64::new(channel.group.consumed_seq());
        Ok(Self {
            channel,
            storage,
            last_seq,
        })
    }

    /// Align the group cursor with the storage engine's committed sequence
    fn reconcile(&self) -> Result<()> {
        let group = &self.channel.group;
        let mut committed = self.storage.committed_seq(&self.channel.key);
        let acknowledged = group.acknowledged_seq();
        if committed < acknowledged {
            // The log was reset past what storage has seen.
            tracing::info!(
                partition = %self.channel.key,
                committed,
                acknowledged,
                "fast-forwarding storage commit"
            );
            self.storage.commit_seq(&self.channel.key, acknowledged);
            committed = acknowledged;
        }

        let target = committed.min(group.queue().appended_seq());
        if target != group.consumed_seq() {
            tracing::info!(
                partition = %self.channel.key,
                from = group.consumed_seq(),
                to = target,
                "aligning local replica cursor with storage"
            );
            self.channel.rewind_to(target)?;
        }
        self.last_seq.store(target, Ordering::Release);
        Ok(())
    }

    fn apply(&self, data: &[u8]) -> Result<usize> {
        let mut rows = decode_chunk(data).inspect_err(|_| metrics::incr(&self.channel.stats.decode_failures))?;
        self.storage
            .lookup_metric_meta(&mut rows)
            .inspect_err(|_| metrics::incr(&self.channel.stats.lookup_failures))?;
        self.storage
            .write(&rows)
            .inspect_err(|_| metrics::incr(&self.channel.stats.write_failures))?;
        Ok(rows.len())
    }

    fn commit(&self, seq: i64) {
        self.storage.commit_seq(&self.channel.key, seq);
        self.last_seq.store(seq, Ordering::Release);
        self.channel.group.ack(seq);
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    fn channel(&self) -> &ReplicatorChannel {
        &self.channel
    }

    async fn is_ready(&self) -> bool {
        if self.channel.state() == ReplicatorState::Ready {
            return true;
        }
        match self.reconcile() {
            Ok(()) => {
                self.channel.set_state(ReplicatorState::Ready);
                true
            }
            Err(e) => {
                tracing::warn!(partition = %self.channel.key, "local replicator reconcile failed: {}", e);
                self.channel.set_state(ReplicatorState::Failure);
                false
            }
        }
    }

    async fn replica(&self, seq: i64, data: &[u8]) {
        let expected = self.last_seq.load(Ordering::Acquire) + 1;
        if seq != expected {
            metrics::incr(&self.channel.stats.invalid_sequences);
            tracing::warn!(
                partition = %self.channel.key,
                seq,
                expected,
                "rejecting out-of-order local replica"
            );
            self.channel.set_state(ReplicatorState::Init);
            return;
        }

        match self.apply(data) {
            Ok(rows) => {
                metrics::incr(&self.channel.stats.replicated);
                metrics::add(&self.channel.stats.replicated_bytes, data.len() as u64);
                tracing::trace!(partition = %self.channel.key, seq, rows, "applied local replica");
            }
            Err(e) => {
                tracing::error!(
                    partition = %self.channel.key,
                    seq,
                    "skipping entry the storage engine rejected: {}",
                    e
                );
            }
        }
        self.commit(seq);
    }

    fn skip(&self, seq: i64, err: &Error) {
        metrics::incr(&self.channel.stats.read_failures);
        tracing::error!(partition = %self.channel.key, seq, "skipping unreadable entry: {}", err);
        self.commit(seq);
    }
}

/// Streams entries to a follower node
pub struct RemoteReplicator {
    channel: ReplicatorChannel,
    transport: Arc<dyn RpcTransport>,
    state_manager: Arc<dyn StateManager>,
    stream: tokio::sync::Mutex<Option<Box<dyn ReplicaStream>>>,
    online: Arc<Notify>,
    node_wait_timeout: Duration,
    rpc_timeout: Duration,
}

impl RemoteReplicator {
    /// Create a remote replicator towards `follower`
    pub fn new(
        key: PartitionKey,
        follower: NodeId,
        fanout: Arc<FanOutQueue>,
        transport: Arc<dyn RpcTransport>,
        state_manager: Arc<dyn StateManager>,
        stats: Arc<ReplicatorStats>,
        node_wait_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let channel = ReplicatorChannel::new(key, follower, fanout, stats)?;

        let online = Arc::new(Notify::new());
        let weak = Arc::downgrade(&online);
        state_manager.watch_node_state_change(
            follower,
            Box::new(move |_| {
                if let Some(online) = weak.upgrade() {
                    online.notify_one();
                }
            }),
        );

        Ok(Self {
            channel,
            transport,
            state_manager,
            stream: tokio::sync::Mutex::new(None),
            online,
            node_wait_timeout,
            rpc_timeout,
        })
    }

    fn index_request(&self) -> IndexRequest {
        IndexRequest::from(&self.channel.key)
    }

    async fn handshake(&self, node: &Node) -> Result<()> {
        let mut stream = self.stream.lock().await;
        if let Some(mut stale) = stream.take() {
            if let Err(e) = stale.close().await {
                tracing::debug!(follower = %self.channel.follower, "closing stale replica stream: {}", e);
            }
        }

        let state = ReplicaState::for_edge(&self.channel.key, self.channel.follower);
        let opened = with_timeout(self.rpc_timeout, self.transport.open_replica_stream(node, &state)).await??;

        let request = self.index_request();
        let follower_ack =
            with_timeout(self.rpc_timeout, self.transport.get_replica_ack_index(node, &request)).await??;

        let group = &self.channel.group;
        let required = group.consumed_seq() + 1;
        let acknowledged = group.acknowledged_seq();
        let appended = group.queue().appended_seq();
        let next = follower_ack + 1;

        if next == required {
            tracing::debug!(follower = %self.channel.follower, follower_ack, "follower in sync");
        } else if follower_ack < acknowledged {
            let append_index = acknowledged + 1;
            tracing::info!(
                follower = %self.channel.follower,
                follower_ack,
                append_index,
                "follower behind retained log, resetting its append index"
            );
            with_timeout(
                self.rpc_timeout,
                self.transport.reset_index(node, &request, append_index),
            )
            .await??;
            metrics::incr(&self.channel.stats.resets);
            group.set_consumed_seq(acknowledged)?;
        } else if follower_ack > appended {
            tracing::warn!(
                follower = %self.channel.follower,
                follower_ack,
                appended,
                "follower ahead of leader log, leader catches up to follower"
            );
            self.channel.fanout.set_appended_seq(follower_ack)?;
        } else {
            tracing::info!(
                follower = %self.channel.follower,
                follower_ack,
                required,
                "rewinding replica cursor to follower ack"
            );
            self.channel.rewind_to(follower_ack)?;
        }

        *stream = Some(opened);
        Ok(())
    }
}

#[async_trait]
impl Replicator for RemoteReplicator {
    fn channel(&self) -> &ReplicatorChannel {
        &self.channel
    }

    async fn is_ready(&self) -> bool {
        loop {
            if self.channel.state() == ReplicatorState::Ready {
                return true;
            }

            let Some(node) = self.state_manager.get_live_node(self.channel.follower) else {
                tracing::debug!(follower = %self.channel.follower, "follower offline, waiting");
                let online = self.online.notified();
                if tokio::time::timeout(self.node_wait_timeout, online).await.is_err() {
                    return false;
                }
                continue;
            };

            return match self.handshake(&node).await {
                Ok(()) => {
                    metrics::incr(&self.channel.stats.handshakes);
                    self.channel.set_state(ReplicatorState::Ready);
                    true
                }
                Err(e) => {
                    metrics::incr(&self.channel.stats.handshake_failures);
                    tracing::warn!(
                        leader = %self.channel.key.leader,
                        follower = %self.channel.follower,
                        "replica handshake failed: {}",
                        e
                    );
                    self.channel.set_state(ReplicatorState::Failure);
                    false
                }
            };
        }
    }

    async fn replica(&self, seq: i64, data: &[u8]) {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            self.channel.set_state(ReplicatorState::Failure);
            return;
        };

        if let Err(e) = stream.send(seq, data).await {
            metrics::incr(&self.channel.stats.send_failures);
            tracing::warn!(follower = %self.channel.follower, seq, "replica send failed: {}", e);
            self.channel.set_state(ReplicatorState::Failure);
            return;
        }

        let response = match stream.recv().await {
            Ok(response) => response,
            Err(e) => {
                metrics::incr(&self.channel.stats.receive_failures);
                tracing::warn!(follower = %self.channel.follower, seq, "replica receive failed: {}", e);
                self.channel.set_state(ReplicatorState::Failure);
                return;
            }
        };

        if response.replica_index == seq && response.ack_index == response.replica_index {
            self.channel.group.ack(seq);
            metrics::incr(&self.channel.stats.replicated);
            metrics::add(&self.channel.stats.replicated_bytes, data.len() as u64);
            return;
        }

        metrics::incr(&self.channel.stats.invalid_acks);
        tracing::warn!(
            follower = %self.channel.follower,
            seq,
            replica_index = response.replica_index,
            ack_index = response.ack_index,
            err = ?response.err,
            "invalid replica ack"
        );
        if response.err.is_some() {
            // Follower rejected the sequence; reconcile before sending more.
            self.channel.set_state(ReplicatorState::Init);
        }
    }

    fn skip(&self, seq: i64, err: &Error) {
        metrics::incr(&self.channel.stats.read_failures);
        tracing::warn!(follower = %self.channel.follower, seq, "cannot read entry for replica: {}", err);
        self.channel.set_state(ReplicatorState::Failure);
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.close().await {
                tracing::debug!(follower = %self.channel.follower, "closing replica stream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::chunk::Chunk;
    use crate::config::QueueConfig;
    use crate::metrics::QueueStats;
    use crate::replication::protocol::ReplicaResponse;
    use crate::testing::{MemoryStorageEngine, RecordingTransport, StaticStateManager, TestContext};
    use crate::types::{BrokerRow, ShardId};

    const LEADER: NodeId = NodeId(1);
    const FOLLOWER: NodeId = NodeId(2);

    fn key() -> PartitionKey {
        PartitionKey::new("db", ShardId(0), 0, LEADER)
    }

    fn fanout(ctx: &TestContext) -> Arc<FanOutQueue> {
        let config = QueueConfig::default()
            .with_data_page_size(64 * 1024)
            .with_max_message_size(16 * 1024);
        Arc::new(FanOutQueue::open(ctx.path(), config, Arc::new(QueueStats::default())).unwrap())
    }

    fn remote(
        fanout: Arc<FanOutQueue>,
        transport: Arc<RecordingTransport>,
        state: Arc<StaticStateManager>,
    ) -> RemoteReplicator {
        RemoteReplicator::new(
            key(),
            FOLLOWER,
            fanout,
            transport,
            state,
            Arc::new(ReplicatorStats::default()),
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    fn online_state() -> Arc<StaticStateManager> {
        let state = Arc::new(StaticStateManager::new());
        state.set_online(FOLLOWER, "127.0.0.1:7002".parse().unwrap());
        state
    }

    /// Leader log with `n` entries, group consumed to `consumed` and acked to `acked`
    fn leader_log(ctx: &TestContext, n: i64, consumed: i64, acked: i64) -> Arc<FanOutQueue> {
        let fanout = fanout(ctx);
        for i in 0..n {
            fanout.put(format!("e{}", i).as_bytes()).unwrap();
        }
        let group = fanout.get_or_create_consumer_group(&FOLLOWER.to_string()).unwrap();
        while group.consumed_seq() < consumed {
            group.consume();
        }
        if acked >= 0 {
            group.ack(acked);
        }
        fanout
    }

    #[tokio::test]
    async fn test_handshake_in_sync_skips_reset() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 12, 10, 8);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(10);

        let replicator = remote(fanout, transport.clone(), online_state());
        assert_eq!(replicator.state(), ReplicatorState::Init);
        assert!(replicator.is_ready().await);
        assert_eq!(replicator.state(), ReplicatorState::Ready);
        assert!(transport.resets().is_empty());
        assert_eq!(replicator.channel().stats().snapshot().handshakes, 1);
    }

    #[tokio::test]
    async fn test_handshake_resets_lagging_follower() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 12, 10, 8);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(5);

        let replicator = remote(fanout, transport.clone(), online_state());
        assert!(replicator.is_ready().await);
        assert_eq!(transport.resets(), vec![9]);
        let group = replicator.channel().consumer_group();
        assert_eq!(group.consumed_seq(), 8);
        assert_eq!(group.consume(), Some(9));
    }

    #[tokio::test]
    async fn test_handshake_leader_catches_up_to_follower() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 3, 2, 1);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(20);

        let replicator = remote(fanout.clone(), transport.clone(), online_state());
        assert!(replicator.is_ready().await);
        assert!(transport.resets().is_empty());
        assert_eq!(fanout.queue().appended_seq(), 20);
        assert_eq!(replicator.channel().consumer_group().consumed_seq(), 20);
        assert_eq!(fanout.put(b"next").unwrap(), 21);
    }

    #[tokio::test]
    async fn test_handshake_rewinds_to_follower_ack() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 12, 10, 4);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(7);

        let replicator = remote(fanout, transport.clone(), online_state());
        assert!(replicator.is_ready().await);
        let group = replicator.channel().consumer_group();
        assert_eq!(group.consumed_seq(), 7);
        assert_eq!(group.acknowledged_seq(), 7);
        assert!(transport.resets().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rpc_failure_leaves_not_ready() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 2, 1, -1);
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_rpcs(true);

        let replicator = remote(fanout, transport.clone(), online_state());
        assert!(!replicator.is_ready().await);
        assert_eq!(replicator.state(), ReplicatorState::Failure);

        transport.fail_rpcs(false);
        transport.set_ack_index(1);
        assert!(replicator.is_ready().await);
    }

    #[tokio::test]
    async fn test_offline_follower_waits_for_online_notification() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 0, -1, -1);
        let transport = Arc::new(RecordingTransport::new());
        let state = Arc::new(StaticStateManager::new());
        let replicator = remote(fanout, transport, state.clone());

        assert!(!replicator.is_ready().await);

        let replicator = Arc::new(replicator);
        let waiter = {
            let replicator = replicator.clone();
            tokio::spawn(async move { replicator.is_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.set_online(FOLLOWER, "127.0.0.1:7002".parse().unwrap());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_replica_advances_only_on_matching_ack() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 7, -1, -1);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(4);

        let replicator = remote(fanout, transport.clone(), online_state());
        let group = replicator.channel().consumer_group().clone();
        // Follower holds 0..=4, the cursor is rewound there.
        assert!(replicator.is_ready().await);
        assert_eq!(group.consume(), Some(5));

        transport.push_response(ReplicaResponse {
            replica_index: 5,
            ack_index: 5,
            err: None,
        });
        replicator.replica(5, b"e5").await;
        assert_eq!(group.acknowledged_seq(), 5);

        assert_eq!(group.consume(), Some(6));
        transport.push_response(ReplicaResponse {
            replica_index: 6,
            ack_index: 5,
            err: None,
        });
        replicator.replica(6, b"e6").await;
        assert_eq!(group.acknowledged_seq(), 5);
        assert_eq!(replicator.state(), ReplicatorState::Ready);
        assert_eq!(replicator.channel().stats().snapshot().invalid_acks, 1);
        assert_eq!(transport.sent(), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_replica_ignores_ack_for_other_index() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 7, -1, -1);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(4);

        let replicator = remote(fanout, transport.clone(), online_state());
        let group = replicator.channel().consumer_group().clone();
        assert!(replicator.is_ready().await);
        assert_eq!(group.consume(), Some(5));

        // Acks 5, but answers for 6.
        transport.push_response(ReplicaResponse {
            replica_index: 6,
            ack_index: 5,
            err: None,
        });
        replicator.replica(5, b"e5").await;
        assert_eq!(group.acknowledged_seq(), 4);
        assert_eq!(replicator.state(), ReplicatorState::Ready);
        assert_eq!(replicator.channel().stats().snapshot().invalid_acks, 1);
        assert_eq!(transport.sent(), vec![5]);
    }

    #[tokio::test]
    async fn test_replica_receive_failure_marks_failure() {
        let ctx = TestContext::new();
        let fanout = leader_log(&ctx, 1, -1, -1);
        let transport = Arc::new(RecordingTransport::new());
        transport.set_ack_index(-1);

        let replicator = remote(fanout, transport.clone(), online_state());
        assert!(replicator.is_ready().await);
        // No scripted response: recv fails.
        replicator.replica(0, b"e0").await;
        assert_eq!(replicator.state(), ReplicatorState::Failure);
        assert_eq!(replicator.channel().stats().snapshot().receive_failures, 1);
    }

    fn chunk(rows: &[BrokerRow]) -> Vec<u8> {
        let mut chunk = Chunk::new(1024 * 1024);
        for row in rows {
            chunk.append(row);
        }
        chunk.compress().unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_local_replicator_applies_and_commits() {
        let ctx = TestContext::new();
        let fanout = fanout(&ctx);
        let storage = Arc::new(MemoryStorageEngine::new());
        let replicator = LocalReplicator::new(
            key(),
            FOLLOWER,
            fanout.clone(),
            storage.clone(),
            Arc::new(ReplicatorStats::default()),
        )
        .unwrap();

        fanout.put(&chunk(&[BrokerRow::new(1, 1, b"a".to_vec())])).unwrap();
        fanout.put(b"not zstd").unwrap();
        fanout
            .put(&chunk(&[BrokerRow::new(2, 2, b"b".to_vec()), BrokerRow::new(3, 3, b"c".to_vec())]))
            .unwrap();

        assert!(replicator.is_ready().await);
        let group = replicator.channel().consumer_group().clone();
        while let Some(seq) = group.consume() {
            let data = group.message(seq).unwrap();
            replicator.replica(seq, &data).await;
        }

        assert_eq!(storage.rows().len(), 3);
        assert_eq!(storage.committed_seq(&key()), 2);
        assert_eq!(group.acknowledged_seq(), 2);
        assert_eq!(replicator.channel().stats().snapshot().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_local_replicator_write_failure_still_commits() {
        let ctx = TestContext::new();
        let fanout = fanout(&ctx);
        let storage = Arc::new(MemoryStorageEngine::new());
        storage.fail_writes(true);
        let replicator = LocalReplicator::new(
            key(),
            FOLLOWER,
            fanout.clone(),
            storage.clone(),
            Arc::new(ReplicatorStats::default()),
        )
        .unwrap();

        fanout.put(&chunk(&[BrokerRow::new(1, 1, b"a".to_vec())])).unwrap();
        assert!(replicator.is_ready().await);
        let seq = replicator.channel().consumer_group().consume().unwrap();
        replicator.replica(seq, &fanout.queue().get(seq).unwrap()).await;

        assert_eq!(storage.committed_seq(&key()), 0);
        assert_eq!(replicator.channel().stats().snapshot().write_failures, 1);
    }

    #[tokio::test]
    async fn test_local_replicator_rejects_unexpected_sequence() {
        let ctx = TestContext::new();
        let fanout = fanout(&ctx);
        let storage = Arc::new(MemoryStorageEngine::new());
        let replicator = LocalReplicator::new(
            key(),
            FOLLOWER,
            fanout.clone(),
            storage.clone(),
            Arc::new(ReplicatorStats::default()),
        )
        .unwrap();
        fanout.put(&chunk(&[BrokerRow::new(1, 1, b"a".to_vec())])).unwrap();
        assert!(replicator.is_ready().await);

        replicator.replica(3, b"whatever").await;
        assert_eq!(replicator.state(), ReplicatorState::Init);
        assert_eq!(replicator.channel().stats().snapshot().invalid_sequences, 1);
        assert_eq!(storage.committed_seq(&key()), -1);
    }

    #[tokio::test]
    async fn test_local_replicator_skips_already_committed() {
        let ctx = TestContext::new();
        let fanout = fanout(&ctx);
        for _ in 0..4 {
            fanout.put(&chunk(&[BrokerRow::new(1, 1, b"a".to_vec())])).unwrap();
        }
        let storage = Arc::new(MemoryStorageEngine::new());
        storage.commit_seq(&key(), 2);

        let replicator = LocalReplicator::new(
            key(),
            FOLLOWER,
            fanout.clone(),
            storage.clone(),
            Arc::new(ReplicatorStats::default()),
        )
        .unwrap();
        assert!(replicator.is_ready().await);
        let group = replicator.channel().consumer_group();
        assert_eq!(group.consumed_seq(), 2);
        assert_eq!(group.acknowledged_seq(), 2);
        assert_eq!(group.consume(), Some(3));
    }
}
