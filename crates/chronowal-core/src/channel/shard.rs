//! Family channels of one shard

use crate::channel::family::FamilyChannel;
use crate::channel::sink::WriteSinkFactory;
use crate::config::ChannelConfig;
use crate::metrics::{self, ChannelStats};
use crate::types::{BrokerRow, FamilyTime, NodeId, ShardId, family_time_of};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

type FamilyMap = BTreeMap<FamilyTime, Arc<FamilyChannel>>;

/// Routes rows of one shard to the family channel of their time bucket
pub struct ShardChannel {
    database: String,
    shard_id: ShardId,
    leader: AtomicU32,
    config: Arc<ChannelConfig>,
    factory: Arc<dyn WriteSinkFactory>,
    stats: Arc<ChannelStats>,
    families: ArcSwap<FamilyMap>,
    mutation_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ShardChannel {
    /// Create a channel sending to `leader`
    pub fn new(
        database: impl Into<String>,
        shard_id: ShardId,
        leader: NodeId,
        config: Arc<ChannelConfig>,
        factory: Arc<dyn WriteSinkFactory>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            database: database.into(),
            shard_id,
            leader: AtomicU32::new(leader.0),
            config,
            factory,
            stats,
            families: ArcSwap::from_pointee(FamilyMap::new()),
            mutation_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Shard ID
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Current leader
    pub fn leader(&self) -> NodeId {
        NodeId(self.leader.load(Ordering::Acquire))
    }

    /// Live family buckets, oldest first
    pub fn family_times(&self) -> Vec<FamilyTime> {
        self.families.load().keys().copied().collect()
    }

    /// Family channel of `family_time`
    pub fn family(&self, family_time: FamilyTime) -> Option<Arc<FamilyChannel>> {
        self.families.load().get(&family_time).cloned()
    }

    /// Buffer rows, grouped by family time bucket
    pub async fn write(&self, rows: Vec<BrokerRow>) -> Result<()> {
        let interval = self.config.family_interval_ms();
        let mut by_family: BTreeMap<FamilyTime, Vec<BrokerRow>> = BTreeMap::new();
        for row in rows {
            by_family
                .entry(family_time_of(row.timestamp, interval))
                .or_default()
                .push(row);
        }

        for (family_time, rows) in by_family {
            let family = self.get_or_create_family(family_time)?;
            family.write(&rows).await?;
        }
        Ok(())
    }

    fn get_or_create_family(&self, family_time: FamilyTime) -> Result<Arc<FamilyChannel>> {
        if let Some(family) = self.family(family_time) {
            return Ok(family);
        }

        let _guard = self.mutation_lock.lock();
        let current = self.families.load_full();
        if let Some(family) = current.get(&family_time) {
            return Ok(family.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!(
                "shard channel {}/{}",
                self.database, self.shard_id
            )));
        }

        let family = Arc::new(FamilyChannel::start(
            self.database.clone(),
            self.shard_id,
            family_time,
            self.leader(),
            self.config.clone(),
            self.factory.clone(),
            self.stats.clone(),
        ));
        let mut next = FamilyMap::clone(&current);
        next.insert(family_time, family.clone());
        self.families.store(Arc::new(next));

        metrics::incr(&self.stats.created_families);
        tracing::debug!(database = %self.database, shard = %self.shard_id, family_time, "created family channel");
        Ok(family)
    }

    /// Point every family channel at `leader`
    pub fn notify_leader_change(&self, leader: NodeId) {
        let _guard = self.mutation_lock.lock();
        let previous = self.leader.swap(leader.0, Ordering::AcqRel);
        if previous != leader.0 {
            tracing::info!(
                database = %self.database,
                shard = %self.shard_id,
                from = previous,
                to = %leader,
                "shard leader changed"
            );
        }
        for family in self.families.load().values() {
            family.notify_leader_change(leader);
        }
    }

    /// Stop and remove family channels outside the acceptance window at `now`
    pub async fn garbage_collect(&self, now: i64) -> usize {
        let expired: Vec<Arc<FamilyChannel>> = {
            let _guard = self.mutation_lock.lock();
            let current = self.families.load_full();
            let mut next = FamilyMap::clone(&current);
            next.retain(|family_time, _| self.config.family_alive(*family_time, now));
            if next.len() == current.len() {
                return 0;
            }
            let expired = current
                .iter()
                .filter(|(family_time, _)| !next.contains_key(family_time))
                .map(|(_, family)| family.clone())
                .collect();
            self.families.store(Arc::new(next));
            expired
        };

        for family in &expired {
            family.stop(self.config.stop_timeout).await;
            metrics::incr(&self.stats.expired_families);
            tracing::debug!(
                database = %self.database,
                shard = %self.shard_id,
                family_time = family.family_time(),
                "removed expired family channel"
            );
        }
        expired.len()
    }

    /// Stop every family channel. Idempotent.
    pub async fn close(&self) {
        let families = {
            let _guard = self.mutation_lock.lock();
            self.closed.store(true, Ordering::Release);
            self.families.swap(Arc::new(FamilyMap::new()))
        };
        for family in families.values() {
            family.stop(self.config.stop_timeout).await;
        }
    }
}

impl std::fmt::Debug for ShardChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardChannel")
            .field("database", &self.database)
            .field("shard_id", &self.shard_id)
            .field("leader", &self.leader())
            .field("families", &self.family_times())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSinkFactory;
    use std::time::{Duration, Instant};

    const HOUR: i64 = 3_600_000;

    fn shard(factory: &Arc<RecordingSinkFactory>) -> ShardChannel {
        let config = ChannelConfig::default()
            .with_batch_timeout(Duration::from_millis(10))
            .with_window(Duration::from_secs(3600), Duration::from_secs(3600));
        ShardChannel::new(
            "db",
            ShardId(4),
            NodeId(1),
            Arc::new(config),
            factory.clone(),
            Arc::new(ChannelStats::default()),
        )
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
    async fn test_rows_split_by_family() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let shard = shard(&factory);

        let rows = vec![
            BrokerRow::new(10 * HOUR + 5, 1, b"a".to_vec()),
            BrokerRow::new(11 * HOUR + 5, 2, b"b".to_vec()),
            BrokerRow::new(10 * HOUR + 9, 3, b"c".to_vec()),
        ];
        shard.write(rows).await.unwrap();
        assert_eq!(shard.family_times(), vec![10 * HOUR, 11 * HOUR]);

        assert!(wait_until(|| factory.rows().len() == 3).await);
        let mut families: Vec<(FamilyTime, ShardId)> = factory
            .chunks()
            .iter()
            .map(|(state, _)| (state.family_time, state.shard_id))
            .collect();
        families.sort();
        assert_eq!(families, vec![(10 * HOUR, ShardId(4)), (11 * HOUR, ShardId(4))]);
        shard.close().await;
    }

    #[tokio::test]
    async fn test_leader_change_reaches_families() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let shard = shard(&factory);
        shard.write(vec![BrokerRow::new(HOUR, 1, b"a".to_vec())]).await.unwrap();

        shard.notify_leader_change(NodeId(3));
        assert_eq!(shard.leader(), NodeId(3));
        assert_eq!(shard.family(HOUR).unwrap().leader(), NodeId(3));

        shard.write(vec![BrokerRow::new(2 * HOUR, 1, b"b".to_vec())]).await.unwrap();
        assert_eq!(shard.family(2 * HOUR).unwrap().leader(), NodeId(3));
        shard.close().await;
    }

    #[tokio::test]
    async fn test_garbage_collect_stops_expired_families() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let shard = shard(&factory);
        shard
            .write(vec![
                BrokerRow::new(0, 1, b"old".to_vec()),
                BrokerRow::new(10 * HOUR, 1, b"new".to_vec()),
            ])
            .await
            .unwrap();
        let old = shard.family(0).unwrap();

        assert_eq!(shard.garbage_collect(10 * HOUR).await, 1);
        assert!(old.is_stopped());
        assert_eq!(shard.family_times(), vec![10 * HOUR]);
        // Rows buffered in the expired family were flushed on stop.
        assert!(factory.rows().iter().any(|row| row.payload == b"old"));
        assert_eq!(shard.garbage_collect(10 * HOUR).await, 0);

        shard.close().await;
        assert!(shard.write(vec![BrokerRow::new(10 * HOUR, 1, b"x".to_vec())]).await.is_err());
    }
}
