//! Per-database ingestion entry point
//!
//! Rows outside the acceptance window are evicted, the rest are spread over
//! the database's shards with a jump consistent hash of their series hash.

use crate::channel::shard::ShardChannel;
use crate::channel::sink::WriteSinkFactory;
use crate::collab::{MetricConverter, StateManager};
use crate::config::ChannelConfig;
use crate::metrics::{self, ChannelStats};
use crate::types::{BrokerRow, ShardId};
use crate::{Error, Result, now_millis};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use siphasher::sip::SipHasher13;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type ShardMap = HashMap<ShardId, Arc<ShardChannel>>;

/// Maps series hashes consistently onto `num_shards` buckets.
///
/// Adding one shard remaps roughly `1/N` of the series.
#[derive(Debug, Clone)]
pub struct JumpHash {
    hasher: SipHasher13,
    num_shards: u32,
}

impl JumpHash {
    /// Hash over `num_shards` buckets (at least one)
    pub fn new(num_shards: u32) -> Self {
        // Static siphash key so every node maps a series to the same shard.
        let key = [
            0x3a, 0x91, 0x0c, 0xe7, 0x52, 0x1f, 0x8d, 0x46, 0xb3, 0x27, 0x6e, 0xd0, 0x14, 0xa9,
            0x7b, 0x58,
        ];
        Self {
            hasher: SipHasher13::new_with_key(&key),
            num_shards: num_shards.max(1),
        }
    }

    /// Shard of `series_hash`
    pub fn shard(&self, series_hash: u64) -> ShardId {
        let mut state = self.hasher.clone();
        series_hash.hash(&mut state);
        let mut key = state.finish();

        let mut b: i64 = -1;
        let mut j: i64 = 0;
        while j < self.num_shards as i64 {
            b = j;
            key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
                as i64;
        }
        ShardId(b.max(0) as u32)
    }
}

/// Ingestion channel of one database
pub struct DatabaseChannel {
    name: String,
    hash: JumpHash,
    config: Arc<ChannelConfig>,
    factory: Arc<dyn WriteSinkFactory>,
    state_manager: Arc<dyn StateManager>,
    stats: Arc<ChannelStats>,
    shards: ArcSwap<ShardMap>,
    mutation_lock: Mutex<()>,
    closed: AtomicBool,
}

impl DatabaseChannel {
    /// Create the channel of `name` spread over `num_shards` shards
    pub fn new(
        name: impl Into<String>,
        num_shards: u32,
        config: Arc<ChannelConfig>,
        factory: Arc<dyn WriteSinkFactory>,
        state_manager: Arc<dyn StateManager>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            name: name.into(),
            hash: JumpHash::new(num_shards),
            config,
            factory,
            state_manager,
            stats,
            shards: ArcSwap::from_pointee(ShardMap::new()),
            mutation_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of shards
    pub fn num_shards(&self) -> u32 {
        self.hash.num_shards
    }

    /// Shard channel of `shard_id`, if rows were routed to it
    pub fn shard(&self, shard_id: ShardId) -> Option<Arc<ShardChannel>> {
        self.shards.load().get(&shard_id).cloned()
    }

    /// Shard channels created so far
    pub fn shards(&self) -> Vec<Arc<ShardChannel>> {
        self.shards.load().values().cloned().collect()
    }

    /// Evict rows outside the acceptance window and route the rest.
    ///
    /// Returns the number of accepted rows.
    pub async fn write(&self, rows: Vec<BrokerRow>) -> Result<usize> {
        let now = now_millis();
        let total = rows.len();
        let mut by_shard: BTreeMap<ShardId, Vec<BrokerRow>> = BTreeMap::new();
        for row in rows {
            if self.config.accepts(row.timestamp, now) {
                by_shard.entry(self.hash.shard(row.series_hash)).or_default().push(row);
            }
        }

        let accepted: usize = by_shard.values().map(Vec::len).sum();
        if accepted < total {
            metrics::add(&self.stats.evicted_rows, (total - accepted) as u64);
            tracing::debug!(database = %self.name, evicted = total - accepted, "evicted rows outside acceptance window");
        }

        for (shard_id, rows) in by_shard {
            let shard = self.get_or_create_shard(shard_id)?;
            shard.write(rows).await?;
        }
        Ok(accepted)
    }

    /// Convert and write metrics; metrics that fail to convert are counted
    /// and skipped.
    pub async fn write_metrics<M: Sync>(&self, batch: &[M], converter: &dyn MetricConverter<M>) -> Result<usize> {
        let mut rows = Vec::with_capacity(batch.len());
        for metric in batch {
            match converter.convert_to(metric) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    metrics::incr(&self.stats.conversion_failures);
                    tracing::debug!(database = %self.name, "skipping unconvertible metric: {}", e);
                }
            }
        }
        self.write(rows).await
    }

    fn get_or_create_shard(&self, shard_id: ShardId) -> Result<Arc<ShardChannel>> {
        if let Some(shard) = self.shard(shard_id) {
            return Ok(shard);
        }

        let _guard = self.mutation_lock.lock();
        let current = self.shards.load_full();
        if let Some(shard) = current.get(&shard_id) {
            return Ok(shard.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!("database channel {}", self.name)));
        }

        let assignment = self
            .state_manager
            .shard_assignment(&self.name, shard_id)
            .ok_or_else(|| Error::channel(format!("no leader for shard {}/{}", self.name, shard_id)))?;
        let shard = Arc::new(ShardChannel::new(
            self.name.clone(),
            shard_id,
            assignment.leader,
            self.config.clone(),
            self.factory.clone(),
            self.stats.clone(),
        ));
        let mut next = ShardMap::clone(&current);
        next.insert(shard_id, shard.clone());
        self.shards.store(Arc::new(next));
        Ok(shard)
    }

    /// Garbage-collect expired family channels of every shard
    pub async fn garbage_collect(&self, now: i64) -> usize {
        let mut removed = 0;
        for shard in self.shards() {
            removed += shard.garbage_collect(now).await;
        }
        removed
    }

    /// Stop every shard channel. Idempotent.
    pub async fn close(&self) {
        let shards = {
            let _guard = self.mutation_lock.lock();
            self.closed.store(true, Ordering::Release);
            self.shards.swap(Arc::new(ShardMap::new()))
        };
        for shard in shards.values() {
            shard.close().await;
        }
    }
}

impl std::fmt::Debug for DatabaseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseChannel")
            .field("name", &self.name)
            .field("num_shards", &self.num_shards())
            .field("shards", &self.shards.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LineConverter, RecordingSinkFactory, StaticStateManager};
    use crate::types::NodeId;
    use proptest::prelude::*;
    use std::time::Duration;

    fn database(num_shards: u32, factory: &Arc<RecordingSinkFactory>) -> (DatabaseChannel, Arc<ChannelStats>) {
        let state = Arc::new(StaticStateManager::new());
        for shard in 0..num_shards {
            state.set_assignment("db", ShardId(shard), NodeId(1), vec![NodeId(1)]);
        }
        let stats = Arc::new(ChannelStats::default());
        let channel = DatabaseChannel::new(
            "db",
            num_shards,
            Arc::new(ChannelConfig::default().with_window(Duration::from_secs(60), Duration::from_secs(60))),
            factory.clone(),
            state,
            stats.clone(),
        );
        (channel, stats)
    }

    #[test]
    fn test_jump_hash_is_stable_and_balanced() {
        let hash = JumpHash::new(8);
        let mut counts = [0usize; 8];
        for series in 0..8_000u64 {
            let shard = hash.shard(series);
            assert_eq!(shard, JumpHash::new(8).shard(series));
            counts[shard.0 as usize] += 1;
        }
        for count in counts {
            assert!((700..1300).contains(&count), "unbalanced shard: {}", count);
        }
        assert_eq!(JumpHash::new(0).shard(42), ShardId(0));
    }

    proptest! {
        #[test]
        fn prop_growing_shards_moves_only_to_new_shard(series in any::<u64>(), n in 1u32..64) {
            let before = JumpHash::new(n).shard(series);
            let after = JumpHash::new(n + 1).shard(series);
            prop_assert!(after == before || after == ShardId(n));
        }
    }

    #[tokio::test]
    async fn test_write_evicts_rows_outside_window() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let (channel, stats) = database(2, &factory);
        let now = now_millis();

        let accepted = channel
            .write(vec![
                BrokerRow::new(now, 1, b"now".to_vec()),
                BrokerRow::new(now - 3_600_000, 2, b"stale".to_vec()),
                BrokerRow::new(now + 3_600_000, 3, b"future".to_vec()),
            ])
            .await
            .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(stats.snapshot().evicted_rows, 2);
        assert_eq!(channel.shards().len(), 1);
        channel.close().await;
        assert_eq!(factory.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_write_metrics_skips_bad_metrics() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let (channel, stats) = database(4, &factory);
        let now = now_millis();
        let metrics: Vec<String> = vec![
            format!("{} cpu.load 0.5", now),
            "garbage".to_string(),
            format!("{} mem.used 12", now),
        ];

        assert_eq!(channel.write_metrics(&metrics, &LineConverter).await.unwrap(), 2);
        assert_eq!(stats.snapshot().conversion_failures, 1);
        channel.close().await;
        assert_eq!(factory.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_assignment_is_an_error() {
        let factory = Arc::new(RecordingSinkFactory::new());
        let channel = DatabaseChannel::new(
            "db",
            1,
            Arc::new(ChannelConfig::default()),
            factory,
            Arc::new(StaticStateManager::new()),
            Arc::new(ChannelStats::default()),
        );
        let result = channel.write(vec![BrokerRow::new(now_millis(), 1, b"x".to_vec())]).await;
        assert!(matches!(result, Err(Error::Channel(_))));
    }
}
