//! Registry of WAL partitions
//!
//! The manager owns every [`Partition`] of this node, recovers them (and
//! their replicator peers) from disk on open, answers the follower-side
//! replication RPCs, and runs a periodic collector that applies each queue's
//! minimum-ack floor and drops expired, fully drained partitions.
//!
//! Opening the manager starts replicator tasks, so it must run inside a
//! tokio runtime.

use crate::replication::protocol::{IndexRequest, ReplicaState, WriteState};
use crate::types::{NodeId, PartitionKey, ShardId};
use crate::wal::{Partition, WalContext};
use crate::{Error, Result, now_millis};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type PartitionMap = HashMap<PartitionKey, Arc<Partition>>;

/// Write-ahead log manager of one node
pub struct WalManager {
    ctx: WalContext,
    partitions: ArcSwap<PartitionMap>,
    mutation_lock: Mutex<()>,
    cancel: CancellationToken,
    gc_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WalManager {
    /// Open the manager and recover all partitions under `ctx.config.dir`
    pub fn open(ctx: WalContext) -> Result<Arc<Self>> {
        ctx.config.validate()?;
        std::fs::create_dir_all(&ctx.config.dir)?;

        let manager = Arc::new(Self {
            ctx,
            partitions: ArcSwap::from_pointee(PartitionMap::new()),
            mutation_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            gc_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        manager.recover()?;
        Ok(manager)
    }

    fn recover(&self) -> Result<()> {
        let mut recovered = PartitionMap::new();
        for key in scan_partitions(&self.ctx.config.dir)? {
            let partition = Arc::new(Partition::open(
                key.clone(),
                self.partition_dir(&key),
                self.ctx.clone(),
            )?);
            partition.recover_replicas()?;
            recovered.insert(key, partition);
        }

        tracing::info!(
            node = %self.ctx.current_node,
            dir = %self.ctx.config.dir.display(),
            partitions = recovered.len(),
            "recovered write-ahead log"
        );
        self.partitions.store(Arc::new(recovered));
        Ok(())
    }

    /// Shared context
    pub fn context(&self) -> &WalContext {
        &self.ctx
    }

    /// This node
    pub fn current_node(&self) -> NodeId {
        self.ctx.current_node
    }

    /// Storage directory of `key`
    pub fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        self.ctx
            .config
            .dir
            .join(&key.database)
            .join(key.shard_id.to_string())
            .join(key.family_time.to_string())
            .join(key.leader.to_string())
    }

    /// Look up a partition
    pub fn get_partition(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.partitions.load().get(key).cloned()
    }

    /// All partitions
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.load().values().cloned().collect()
    }

    /// Get the partition for `key`, creating it on first access
    pub fn get_or_create_partition(&self, key: &PartitionKey) -> Result<Arc<Partition>> {
        if let Some(partition) = self.get_partition(key) {
            return Ok(partition);
        }
        validate_database(&key.database)?;

        let _guard = self.mutation_lock.lock();
        let current = self.partitions.load_full();
        if let Some(partition) = current.get(key) {
            return Ok(partition.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("write-ahead log manager"));
        }

        let partition = Arc::new(Partition::open(
            key.clone(),
            self.partition_dir(key),
            self.ctx.clone(),
        )?);
        let mut next = PartitionMap::clone(&current);
        next.insert(key.clone(), partition.clone());
        self.partitions.store(Arc::new(next));

        tracing::info!(partition = %key, "created partition");
        Ok(partition)
    }

    /// Leader write path: partition for a write stream, with replicators
    /// towards every replica of the shard
    pub fn open_write(&self, state: &WriteState) -> Result<Arc<Partition>> {
        if state.leader != self.ctx.current_node {
            return Err(Error::replication(format!(
                "node {} is not the leader {} of {}/{}",
                self.ctx.current_node, state.leader, state.database, state.shard_id
            )));
        }

        let partition = self.get_or_create_partition(&state.partition_key())?;
        let replicas = self.replicas_of(&state.database, state.shard_id);
        partition.build_replica_for_leader(state.leader, &replicas)?;
        Ok(partition)
    }

    fn replicas_of(&self, database: &str, shard: ShardId) -> Vec<NodeId> {
        match self.ctx.state_manager.shard_assignment(database, shard) {
            Some(assignment) if !assignment.replicas.is_empty() => assignment.replicas,
            _ => {
                tracing::warn!(database, %shard, "no shard assignment, replicating locally only");
                vec![self.ctx.current_node]
            }
        }
    }

    /// Follower side of a replica stream: partition plus local replicator
    pub fn open_replica(&self, state: &ReplicaState) -> Result<Arc<Partition>> {
        let partition = self.get_or_create_partition(&state.partition_key())?;
        partition.build_replica_for_follower(state.leader, state.follower)?;
        Ok(partition)
    }

    /// Last index this follower holds for the addressed log
    pub fn replica_ack_index(&self, request: &IndexRequest) -> Result<i64> {
        let partition = self.get_or_create_partition(&request.partition_key())?;
        Ok(partition.replica_ack_index())
    }

    /// Make the addressed log continue at `append_index`
    pub fn reset_index(&self, request: &IndexRequest, append_index: i64) -> Result<()> {
        let partition = self.get_or_create_partition(&request.partition_key())?;
        partition.reset_replica_index(append_index)
    }

    /// Start the periodic collector. Calling it again is a no-op.
    pub fn start_gc(self: &Arc<Self>) {
        let mut handle = self.gc_handle.lock();
        if handle.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.ctx.config.gc_interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.garbage_collect(now_millis()).await;
                    }
                }
            }
            tracing::debug!("write-ahead log collector stopped");
        }));
    }

    /// Apply every queue's ack floor, then close and delete partitions whose
    /// family expired before `now` and that every follower drained.
    ///
    /// Returns the number of removed partitions.
    pub async fn garbage_collect(&self, now: i64) -> usize {
        let ttl = self.ctx.config.family_ttl;
        let removed: Vec<Arc<Partition>> = {
            let _guard = self.mutation_lock.lock();
            let current = self.partitions.load_full();
            for partition in current.values() {
                partition.sync();
            }

            let expired: Vec<PartitionKey> = current
                .iter()
                .filter(|(_, p)| p.is_expired(now, ttl) && p.is_drained())
                .map(|(key, _)| key.clone())
                .collect();
            if expired.is_empty() {
                return 0;
            }

            let mut next = PartitionMap::clone(&current);
            let removed = expired.iter().filter_map(|key| next.remove(key)).collect();
            self.partitions.store(Arc::new(next));
            removed
        };

        for partition in &removed {
            if let Err(e) = partition.close().await {
                tracing::warn!(partition = %partition.key(), "failed to close expired partition: {}", e);
            }
            match std::fs::remove_dir_all(partition.dir()) {
                Ok(()) => tracing::info!(partition = %partition.key(), "removed expired partition"),
                Err(e) => tracing::warn!(partition = %partition.key(), "failed to remove partition dir: {}", e),
            }
        }
        removed.len()
    }

    /// Stop the collector and close every partition. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let handle = self.gc_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("write-ahead log collector failed: {}", e);
            }
        }

        let partitions = {
            let _guard = self.mutation_lock.lock();
            self.partitions.swap(Arc::new(PartitionMap::new()))
        };
        let mut first_error = None;
        for partition in partitions.values() {
            if let Err(e) = partition.close().await {
                tracing::warn!(partition = %partition.key(), "failed to close partition: {}", e);
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(node = %self.ctx.current_node, "closed write-ahead log");
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("ctx", &self.ctx)
            .field("partitions", &self.partitions.load().len())
            .finish()
    }
}

fn validate_database(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::config(format!("invalid database name {:?}", name)));
    }
    Ok(())
}

/// Partition keys found under `dir` (`<database>/<shard>/<family>/<leader>`)
fn scan_partitions(dir: &Path) -> Result<Vec<PartitionKey>> {
    let mut keys = Vec::new();
    for database in subdirs(dir)? {
        let Some(db_name) = file_name(&database) else { continue };
        for shard in subdirs(&database)? {
            let Some(shard_id) = parse_name::<u32>(&shard) else { continue };
            for family in subdirs(&shard)? {
                let Some(family_time) = parse_name::<i64>(&family) else { continue };
                for leader in subdirs(&family)? {
                    let Some(leader) = parse_name::<u32>(&leader) else { continue };
                    keys.push(PartitionKey::new(
                        db_name.clone(),
                        ShardId(shard_id),
                        family_time,
                        NodeId(leader),
                    ));
                }
            }
        }
    }
    keys.sort();
    Ok(keys)
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn parse_name<T: std::str::FromStr>(path: &Path) -> Option<T> {
    let name = file_name(path)?;
    let parsed = name.parse().ok();
    if parsed.is_none() {
        tracing::warn!(path = %path.display(), "skipping unrecognized directory in write-ahead log");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::StorageEngine;
    use crate::config::{QueueConfig, WalConfig};
    use crate::testing::{MemoryStorageEngine, RecordingTransport, StaticStateManager, TestContext};
    use std::time::{Duration, Instant};

    const LEADER: NodeId = NodeId(1);
    const FOLLOWER: NodeId = NodeId(2);
    const HOUR: i64 = 3_600_000;

    fn open(
        dir: &Path,
        node: NodeId,
        storage: Arc<MemoryStorageEngine>,
        state: Arc<StaticStateManager>,
    ) -> Arc<WalManager> {
        let mut config = WalConfig::new(dir)
            .with_queue(
                QueueConfig::default()
                    .with_data_page_size(64 * 1024)
                    .with_max_message_size(1024),
            )
            .with_replica_idle(Duration::from_millis(10))
            .with_family_ttl(Duration::from_millis(HOUR as u64));
        config.node_wait_timeout = Duration::from_millis(20);
        WalManager::open(WalContext::new(
            node,
            config,
            storage,
            state,
            Arc::new(RecordingTransport::new()),
        ))
        .unwrap()
    }

    fn write_state(family_time: i64) -> WriteState {
        WriteState {
            database: "db".to_string(),
            shard_id: ShardId(0),
            leader: LEADER,
            family_time,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_open_write_builds_replicas_from_assignment() {
        let ctx = TestContext::new();
        let state = Arc::new(StaticStateManager::new());
        state.set_assignment("db", ShardId(0), LEADER, vec![LEADER, FOLLOWER]);
        let manager = open(ctx.path(), LEADER, Arc::new(MemoryStorageEngine::new()), state);

        let partition = manager.open_write(&write_state(0)).unwrap();
        assert_eq!(partition.followers(), vec![LEADER, FOLLOWER]);
        assert!(Arc::ptr_eq(&partition, &manager.open_write(&write_state(0)).unwrap()));
        assert_eq!(manager.partitions().len(), 1);
        assert_eq!(
            partition.dir(),
            ctx.path().join("db").join("0").join("0").join("1").as_path()
        );

        let foreign = WriteState {
            leader: FOLLOWER,
            ..write_state(0)
        };
        assert!(manager.open_write(&foreign).is_err());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_rpcs() {
        let ctx = TestContext::new();
        let manager = open(
            ctx.path(),
            FOLLOWER,
            Arc::new(MemoryStorageEngine::new()),
            Arc::new(StaticStateManager::new()),
        );
        let key = PartitionKey::new("db", ShardId(3), 0, LEADER);
        let request = IndexRequest::from(&key);

        assert_eq!(manager.replica_ack_index(&request).unwrap(), -1);
        manager.reset_index(&request, 5).unwrap();
        assert_eq!(manager.replica_ack_index(&request).unwrap(), 4);

        let partition = manager
            .open_replica(&ReplicaState::for_edge(&key, FOLLOWER))
            .unwrap();
        assert_eq!(partition.followers(), vec![FOLLOWER]);
        assert!(
            manager
                .open_replica(&ReplicaState::for_edge(&key, NodeId(9)))
                .is_err()
        );

        let bad = IndexRequest {
            database: "../escape".to_string(),
            ..request
        };
        assert!(manager.replica_ack_index(&bad).is_err());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_partitions_and_peers() {
        let ctx = TestContext::new();
        let storage = Arc::new(MemoryStorageEngine::new());
        let state = Arc::new(StaticStateManager::new());
        let key = write_state(HOUR).partition_key();

        let manager = open(ctx.path(), LEADER, storage.clone(), state.clone());
        let partition = manager.open_write(&write_state(HOUR)).unwrap();
        for i in 0..3 {
            partition.write_log(format!("w{}", i).as_bytes()).unwrap();
        }
        assert!(wait_until(|| storage.committed_seq(&key) == 2).await);
        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert!(manager.get_or_create_partition(&key).is_err());

        std::fs::create_dir_all(ctx.path().join("db").join("not-a-shard")).unwrap();
        let reopened = open(ctx.path(), LEADER, storage.clone(), state);
        let partition = reopened.get_partition(&key).unwrap();
        assert_eq!(partition.followers(), vec![LEADER]);
        assert_eq!(partition.fanout().queue().appended_seq(), 2);
        assert_eq!(partition.write_log(b"w3").unwrap(), 3);
        assert!(wait_until(|| storage.committed_seq(&key) == 3).await);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_collect_removes_expired_drained_partitions() {
        let ctx = TestContext::new();
        let storage = Arc::new(MemoryStorageEngine::new());
        let manager = open(
            ctx.path(),
            LEADER,
            storage.clone(),
            Arc::new(StaticStateManager::new()),
        );

        let old = manager.open_write(&write_state(0)).unwrap();
        old.write_log(b"old").unwrap();
        let recent = manager.open_write(&write_state(10 * HOUR)).unwrap();
        recent.write_log(b"recent").unwrap();
        assert!(wait_until(|| old.is_drained() && recent.is_drained()).await);

        // Expired but still pending for an unreachable follower.
        let stuck_key = PartitionKey::new("db", ShardId(1), 0, LEADER);
        let stuck = manager.get_or_create_partition(&stuck_key).unwrap();
        stuck.fanout().get_or_create_consumer_group("2").unwrap();
        stuck.write_log(b"pending").unwrap();

        assert_eq!(manager.garbage_collect(10 * HOUR).await, 1);
        assert!(manager.get_partition(old.key()).is_none());
        assert!(!old.dir().exists());
        assert!(manager.get_partition(recent.key()).is_some());
        assert!(manager.get_partition(&stuck_key).is_some());
        assert_eq!(manager.garbage_collect(10 * HOUR).await, 0);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_task_stops_on_close() {
        let ctx = TestContext::new();
        let manager = open(
            ctx.path(),
            LEADER,
            Arc::new(MemoryStorageEngine::new()),
            Arc::new(StaticStateManager::new()),
        );
        manager.start_gc();
        manager.start_gc();
        manager.close().await.unwrap();
        assert!(manager.gc_handle.lock().is_none());
    }
}
