//! Registry of database channels

use crate::channel::database::DatabaseChannel;
use crate::channel::sink::WriteSinkFactory;
use crate::collab::{MetricConverter, StateManager};
use crate::config::ChannelConfig;
use crate::metrics::ChannelStats;
use crate::types::{BrokerRow, NodeId, ShardId};
use crate::{Error, Result, now_millis};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type DatabaseMap = HashMap<String, Arc<DatabaseChannel>>;

/// Entry point of the ingestion path
pub struct ChannelManager {
    config: Arc<ChannelConfig>,
    factory: Arc<dyn WriteSinkFactory>,
    state_manager: Arc<dyn StateManager>,
    stats: Arc<ChannelStats>,
    databases: ArcSwap<DatabaseMap>,
    mutation_lock: Mutex<()>,
    cancel: CancellationToken,
    gc_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChannelManager {
    /// Create a manager; call [`start_gc`](Self::start_gc) to expire
    /// family channels in the background
    pub fn new(
        config: ChannelConfig,
        factory: Arc<dyn WriteSinkFactory>,
        state_manager: Arc<dyn StateManager>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            factory,
            state_manager,
            stats: Arc::new(ChannelStats::default()),
            databases: ArcSwap::from_pointee(DatabaseMap::new()),
            mutation_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            gc_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Ingestion statistics
    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    /// Channel of `database`
    pub fn database(&self, database: &str) -> Option<Arc<DatabaseChannel>> {
        self.databases.load().get(database).cloned()
    }

    /// Create the channel of `database`. An existing channel is returned as
    /// is; its shard count must match.
    pub fn create_database(&self, database: &str, num_shards: u32) -> Result<Arc<DatabaseChannel>> {
        if num_shards == 0 {
            return Err(Error::config(format!("database {} needs at least one shard", database)));
        }
        if let Some(channel) = self.database(database) {
            return check_shards(channel, num_shards);
        }

        let _guard = self.mutation_lock.lock();
        let current = self.databases.load_full();
        if let Some(channel) = current.get(database) {
            return check_shards(channel.clone(), num_shards);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("channel manager"));
        }

        let channel = Arc::new(DatabaseChannel::new(
            database,
            num_shards,
            self.config.clone(),
            self.factory.clone(),
            self.state_manager.clone(),
            self.stats.clone(),
        ));
        let mut next = DatabaseMap::clone(&current);
        next.insert(database.to_string(), channel.clone());
        self.databases.store(Arc::new(next));

        tracing::info!(database, num_shards, "created database channel");
        Ok(channel)
    }

    fn require(&self, database: &str) -> Result<Arc<DatabaseChannel>> {
        self.database(database)
            .ok_or_else(|| Error::channel(format!("database {} not found", database)))
    }

    /// Write rows into `database`. Returns the number of accepted rows.
    pub async fn write(&self, database: &str, rows: Vec<BrokerRow>) -> Result<usize> {
        self.require(database)?.write(rows).await
    }

    /// Convert and write metrics into `database`
    pub async fn write_metrics<M: Sync>(
        &self,
        database: &str,
        batch: &[M],
        converter: &dyn MetricConverter<M>,
    ) -> Result<usize> {
        self.require(database)?.write_metrics(batch, converter).await
    }

    /// Route future chunks of a shard to `leader`
    pub fn notify_leader_change(&self, database: &str, shard_id: ShardId, leader: NodeId) {
        let Some(shard) = self.database(database).and_then(|db| db.shard(shard_id)) else {
            tracing::debug!(database, shard = %shard_id, %leader, "leader change for inactive shard");
            return;
        };
        shard.notify_leader_change(leader);
    }

    /// Start the periodic family channel collector. Calling it again is a
    /// no-op.
    pub fn start_gc(self: &Arc<Self>) {
        let mut handle = self.gc_handle.lock();
        if handle.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.gc_interval;
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
        }));
    }

    /// Stop family channels whose bucket left the acceptance window
    pub async fn garbage_collect(&self, now: i64) -> usize {
        let databases: Vec<Arc<DatabaseChannel>> = self.databases.load().values().cloned().collect();
        let mut removed = 0;
        for database in databases {
            removed += database.garbage_collect(now).await;
        }
        if removed > 0 {
            tracing::debug!(removed, "expired family channels");
        }
        removed
    }

    /// Flush and stop everything. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let handle = self.gc_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("channel collector failed: {}", e);
            }
        }

        let databases = {
            let _guard = self.mutation_lock.lock();
            self.databases.swap(Arc::new(DatabaseMap::new()))
        };
        for database in databases.values() {
            database.close().await;
        }
        tracing::info!("closed channel manager");
    }
}

fn check_shards(channel: Arc<DatabaseChannel>, num_shards: u32) -> Result<Arc<DatabaseChannel>> {
    if channel.num_shards() != num_shards {
        return Err(Error::config(format!(
            "database {} has {} shards, not {}",
            channel.name(),
            channel.num_shards(),
            num_shards
        )));
    }
    Ok(channel)
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("databases", &self.databases.load().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LineConverter, RecordingSinkFactory, StaticStateManager};
    use std::time::{Duration, Instant};

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

    fn manager(factory: &Arc<RecordingSinkFactory>, state: &Arc<StaticStateManager>) -> Arc<ChannelManager> {
        let config = ChannelConfig::default().with_batch_timeout(Duration::from_millis(10));
        ChannelManager::new(config, factory.clone(), state.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_create_database() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let state = Arc::new(StaticStateManager::new());
        let manager = manager(&factory, &state);

        let db = manager.create_database("db", 2).unwrap();
        assert!(Arc::ptr_eq(&db, &manager.create_database("db", 2).unwrap()));
        assert!(manager.create_database("db", 3).is_err());
        assert!(manager.create_database("other", 0).is_err());
        assert!(manager.write("missing", Vec::new()).await.is_err());

        manager.close().await;
        manager.close().await;
        assert!(manager.create_database("late", 1).is_err());
    }

    #[tokio::test]
    async fn test_write_and_leader_change() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let state = Arc::new(StaticStateManager::new());
        state.set_assignment("db", ShardId(0), NodeId(1), vec![NodeId(1), NodeId(2)]);
        let manager = manager(&factory, &state);
        manager.create_database("db", 1).unwrap();

        let now = now_millis();
        let metrics = vec![format!("{} cpu 1", now)];
        assert_eq!(manager.write_metrics("db", &metrics, &LineConverter).await.unwrap(), 1);
        assert!(wait_until(|| factory.chunks().len() == 1).await);

        manager.notify_leader_change("db", ShardId(0), NodeId(2));
        manager.notify_leader_change("db", ShardId(7), NodeId(2));
        manager
            .write("db", vec![BrokerRow::new(now, 9, b"after".to_vec())])
            .await
            .unwrap();
        assert!(wait_until(|| factory.chunks().len() == 2).await);
        assert_eq!(factory.chunks()[1].0.leader, NodeId(2));
        assert_eq!(manager.stats().snapshot().leader_changes, 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_gc_task_stops_on_close() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let state = Arc::new(StaticStateManager::new());
        let manager = manager(&factory, &state);
        manager.start_gc();
        manager.start_gc();
        manager.close().await;
        assert!(manager.gc_handle.lock().is_none());
    }
}
