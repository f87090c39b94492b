//! In-memory storage engine, cluster state and write sinks

use crate::channel::chunk::decode_chunk;
use crate::channel::sink::{WriteSink, WriteSinkFactory};
use crate::collab::{MetricConverter, NodeStateCallback, StateManager, StorageEngine};
use crate::replication::protocol::WriteState;
use crate::types::{BrokerRow, Node, NodeId, PartitionKey, SEQ_EMPTY, ShardAssignment, ShardId};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Storage engine keeping rows and commit marks in memory
#[derive(Default)]
pub struct MemoryStorageEngine {
    rows: Mutex<Vec<BrokerRow>>,
    committed: Mutex<HashMap<PartitionKey, i64>>,
    fail_writes: AtomicBool,
    fail_lookups: AtomicBool,
}

impl MemoryStorageEngine {
    /// Empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows written so far, in write order
    pub fn rows(&self) -> Vec<BrokerRow> {
        self.rows.lock().clone()
    }

    /// Make every `write` fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every `lookup_metric_meta` fail
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn lookup_metric_meta(&self, _rows: &mut [BrokerRow]) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(Error::storage("metric metadata unavailable"));
        }
        Ok(())
    }

    fn write(&self, rows: &[BrokerRow]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("write rejected"));
        }
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }

    fn committed_seq(&self, key: &PartitionKey) -> i64 {
        self.committed.lock().get(key).copied().unwrap_or(SEQ_EMPTY)
    }

    fn commit_seq(&self, key: &PartitionKey, seq: i64) {
        self.committed.lock().insert(key.clone(), seq);
    }
}

/// Cluster state driven by the test
#[derive(Default)]
pub struct StaticStateManager {
    nodes: RwLock<HashMap<NodeId, Node>>,
    assignments: RwLock<HashMap<(String, ShardId), ShardAssignment>>,
    watchers: Mutex<HashMap<NodeId, Vec<NodeStateCallback>>>,
}

impl StaticStateManager {
    /// No nodes online, no assignments
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node` online at `addr` and notify its watchers
    pub fn set_online(&self, node: NodeId, addr: SocketAddr) {
        self.nodes.write().insert(node, Node { id: node, addr });
        self.fire(node);
    }

    /// Mark `node` offline and notify its watchers
    pub fn set_offline(&self, node: NodeId) {
        self.nodes.write().remove(&node);
        self.fire(node);
    }

    /// Assign `replicas` (leader included) to a shard
    pub fn set_assignment(&self, database: &str, shard: ShardId, leader: NodeId, replicas: Vec<NodeId>) {
        self.assignments
            .write()
            .insert((database.to_string(), shard), ShardAssignment { leader, replicas });
    }

    fn fire(&self, node: NodeId) {
        if let Some(callbacks) = self.watchers.lock().get(&node) {
            for callback in callbacks {
                callback(node);
            }
        }
    }
}

impl StateManager for StaticStateManager {
    fn get_live_node(&self, node: NodeId) -> Option<Node> {
        self.nodes.read().get(&node).cloned()
    }

    fn watch_node_state_change(&self, node: NodeId, callback: NodeStateCallback) {
        self.watchers.lock().entry(node).or_default().push(callback);
    }

    fn shard_assignment(&self, database: &str, shard: ShardId) -> Option<ShardAssignment> {
        self.assignments
            .read()
            .get(&(database.to_string(), shard))
            .cloned()
    }
}

#[derive(Default)]
struct SinkRecord {
    fail: AtomicBool,
    max_chunk: AtomicUsize,
    created: AtomicUsize,
    chunks: Mutex<Vec<(WriteState, Vec<u8>)>>,
}

/// Write sink factory keeping every delivered chunk in memory
#[derive(Default)]
pub struct RecordingSinkFactory {
    record: Arc<SinkRecord>,
}

impl RecordingSinkFactory {
    /// Factory whose sinks accept everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sink creation and writes fail
    pub fn fail(&self, fail: bool) {
        self.record.fail.store(fail, Ordering::SeqCst);
    }

    /// Refuse chunks larger than `limit` bytes the way a leader WAL does
    pub fn reject_larger_than(&self, limit: usize) {
        self.record.max_chunk.store(limit, Ordering::SeqCst);
    }

    /// Sinks created so far
    pub fn created(&self) -> usize {
        self.record.created.load(Ordering::SeqCst)
    }

    /// Delivered chunks with the stream state they were sent on
    pub fn chunks(&self) -> Vec<(WriteState, Vec<u8>)> {
        self.record.chunks.lock().clone()
    }

    /// Rows of every delivered chunk, in delivery order
    pub fn rows(&self) -> Vec<BrokerRow> {
        self.record
            .chunks
            .lock()
            .iter()
            .flat_map(|(_, chunk)| decode_chunk(chunk).unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl WriteSinkFactory for RecordingSinkFactory {
    async fn create(&self, state: &WriteState) -> Result<Box<dyn WriteSink>> {
        if self.record.fail.load(Ordering::SeqCst) {
            return Err(Error::channel("leader unavailable"));
        }
        self.record.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSink {
            state: state.clone(),
            record: self.record.clone(),
        }))
    }
}

struct RecordingSink {
    state: WriteState,
    record: Arc<SinkRecord>,
}

#[async_trait]
impl WriteSink for RecordingSink {
    fn leader(&self) -> NodeId {
        self.state.leader
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.record.fail.load(Ordering::SeqCst) {
            return Err(Error::replication("write rejected"));
        }
        let limit = self.record.max_chunk.load(Ordering::SeqCst);
        if limit > 0 && chunk.len() > limit {
            return Err(Error::ExceedingMessageSizeLimit {
                size: chunk.len(),
                limit,
            });
        }
        self.record.chunks.lock().push((self.state.clone(), chunk.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Text metrics `"<timestamp> <series> <value>"`; the series name is hashed
/// into the row's series hash
#[derive(Debug, Default)]
pub struct LineConverter;

impl MetricConverter<String> for LineConverter {
    fn convert_to(&self, metric: &String) -> Result<BrokerRow> {
        let mut fields = metric.split_whitespace();
        let (Some(timestamp), Some(series), Some(_value), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::channel(format!("malformed metric {:?}", metric)));
        };
        let timestamp = timestamp
            .parse()
            .map_err(|e| Error::channel(format!("bad timestamp in {:?}: {}", metric, e)))?;
        let series_hash = series.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
        });
        Ok(BrokerRow::new(timestamp, series_hash, metric.as_bytes().to_vec()))
    }
}
