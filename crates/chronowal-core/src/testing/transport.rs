//! In-process transports
//!
//! [`RecordingTransport`] plays a scripted follower and records what the
//! leader sent. [`LoopbackTransport`] delivers every call to the
//! [`WalManager`] registered for the target node, exercising the same
//! follower-side code paths as the TCP server.

use crate::replication::protocol::{IndexRequest, ReplicaResponse, ReplicaState, WriteState};
use crate::replication::server::replica_response;
use crate::replication::transport::{ReplicaStream, RpcTransport, WriteStream};
use crate::types::{Node, NodeId, SEQ_EMPTY};
use crate::wal::{Partition, WalManager};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

#[derive(Debug)]
struct Recording {
    ack_index: i64,
    fail_rpcs: bool,
    fail_writes: bool,
    auto_ack: bool,
    resets: Vec<i64>,
    responses: VecDeque<ReplicaResponse>,
    sent: Vec<i64>,
    writes: Vec<Vec<u8>>,
}

/// Scripted follower
///
/// Replica stream `recv` returns the next pushed response, or with
/// [`auto_ack`](Self::auto_ack) an ack of the last send; otherwise it fails
/// immediately.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingTransport {
    /// Follower with an empty log
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Recording {
                ack_index: SEQ_EMPTY,
                fail_rpcs: false,
                fail_writes: false,
                auto_ack: false,
                resets: Vec::new(),
                responses: VecDeque::new(),
                sent: Vec::new(),
                writes: Vec::new(),
            })),
        }
    }

    /// Index returned by `get_replica_ack_index`
    pub fn set_ack_index(&self, ack_index: i64) {
        self.inner.lock().ack_index = ack_index;
    }

    /// Make unary calls and stream opens fail
    pub fn fail_rpcs(&self, fail: bool) {
        self.inner.lock().fail_rpcs = fail;
    }

    /// Make write stream answers fail
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Acknowledge every replica send when no response is scripted
    pub fn auto_ack(&self, enabled: bool) {
        self.inner.lock().auto_ack = enabled;
    }

    /// Script the next replica response
    pub fn push_response(&self, response: ReplicaResponse) {
        self.inner.lock().responses.push_back(response);
    }

    /// Append indexes passed to `reset_index`
    pub fn resets(&self) -> Vec<i64> {
        self.inner.lock().resets.clone()
    }

    /// Sequences sent on replica streams
    pub fn sent(&self) -> Vec<i64> {
        self.inner.lock().sent.clone()
    }

    /// Records sent on write streams
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    fn check_rpc(&self) -> Result<()> {
        if self.inner.lock().fail_rpcs {
            return Err(Error::replication("connection refused"));
        }
        Ok(())
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcTransport for RecordingTransport {
    async fn get_replica_ack_index(&self, _node: &Node, _request: &IndexRequest) -> Result<i64> {
        self.check_rpc()?;
        Ok(self.inner.lock().ack_index)
    }

    async fn reset_index(&self, _node: &Node, _request: &IndexRequest, append_index: i64) -> Result<()> {
        self.check_rpc()?;
        let mut inner = self.inner.lock();
        inner.resets.push(append_index);
        inner.ack_index = append_index - 1;
        Ok(())
    }

    async fn open_replica_stream(&self, _node: &Node, _state: &ReplicaState) -> Result<Box<dyn ReplicaStream>> {
        self.check_rpc()?;
        Ok(Box::new(RecordingReplicaStream {
            inner: self.inner.clone(),
            last_sent: None,
        }))
    }

    async fn open_write_stream(&self, _node: &Node, _state: &WriteState) -> Result<Box<dyn WriteStream>> {
        self.check_rpc()?;
        Ok(Box::new(RecordingWriteStream {
            inner: self.inner.clone(),
        }))
    }
}

struct RecordingReplicaStream {
    inner: Arc<Mutex<Recording>>,
    last_sent: Option<i64>,
}

#[async_trait]
impl ReplicaStream for RecordingReplicaStream {
    async fn send(&mut self, replica_index: i64, _record: &[u8]) -> Result<()> {
        self.inner.lock().sent.push(replica_index);
        self.last_sent = Some(replica_index);
        Ok(())
    }

    async fn recv(&mut self) -> Result<ReplicaResponse> {
        let mut inner = self.inner.lock();
        if let Some(response) = inner.responses.pop_front() {
            return Ok(response);
        }
        match self.last_sent.take() {
            Some(seq) if inner.auto_ack => {
                inner.ack_index = seq;
                Ok(ReplicaResponse {
                    replica_index: seq,
                    ack_index: seq,
                    err: None,
                })
            }
            _ => Err(Error::replication("no response from follower")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct RecordingWriteStream {
    inner: Arc<Mutex<Recording>>,
}

#[async_trait]
impl WriteStream for RecordingWriteStream {
    async fn send(&mut self, record: &[u8]) -> Result<()> {
        self.inner.lock().writes.push(record.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<()> {
        if self.inner.lock().fail_writes {
            return Err(Error::replication("leader rejected write"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Loopback {
    managers: RwLock<HashMap<NodeId, Weak<WalManager>>>,
    down: RwLock<HashSet<NodeId>>,
}

impl Loopback {
    fn resolve(&self, node: NodeId) -> Result<Arc<WalManager>> {
        if self.down.read().contains(&node) {
            return Err(Error::replication(format!("node {} unreachable", node)));
        }
        self.managers
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::replication(format!("node {} not registered", node)))
    }
}

/// Routes calls to in-process WAL managers
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Loopback>,
}

impl LoopbackTransport {
    /// Transport with no reachable nodes
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `manager` reachable as its current node
    pub fn register(&self, manager: &Arc<WalManager>) {
        self.inner
            .managers
            .write()
            .insert(manager.current_node(), Arc::downgrade(manager));
    }

    /// Fail every call and open stream towards `node`
    pub fn disconnect(&self, node: NodeId) {
        self.inner.down.write().insert(node);
    }

    /// Undo [`disconnect`](Self::disconnect)
    pub fn reconnect(&self, node: NodeId) {
        self.inner.down.write().remove(&node);
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn get_replica_ack_index(&self, node: &Node, request: &IndexRequest) -> Result<i64> {
        self.inner.resolve(node.id)?.replica_ack_index(request)
    }

    async fn reset_index(&self, node: &Node, request: &IndexRequest, append_index: i64) -> Result<()> {
        self.inner.resolve(node.id)?.reset_index(request, append_index)
    }

    async fn open_replica_stream(&self, node: &Node, state: &ReplicaState) -> Result<Box<dyn ReplicaStream>> {
        let partition = self.inner.resolve(node.id)?.open_replica(state)?;
        Ok(Box::new(LoopbackReplicaStream {
            transport: self.inner.clone(),
            node: node.id,
            partition,
            responses: VecDeque::new(),
        }))
    }

    async fn open_write_stream(&self, node: &Node, state: &WriteState) -> Result<Box<dyn WriteStream>> {
        let partition = self.inner.resolve(node.id)?.open_write(state)?;
        Ok(Box::new(LoopbackWriteStream {
            transport: self.inner.clone(),
            node: node.id,
            partition,
            answers: VecDeque::new(),
        }))
    }
}

struct LoopbackReplicaStream {
    transport: Arc<Loopback>,
    node: NodeId,
    partition: Arc<Partition>,
    responses: VecDeque<ReplicaResponse>,
}

#[async_trait]
impl ReplicaStream for LoopbackReplicaStream {
    async fn send(&mut self, replica_index: i64, record: &[u8]) -> Result<()> {
        self.transport.resolve(self.node)?;
        let response = replica_response(&self.partition, replica_index, record);
        self.responses.push_back(response);
        Ok(())
    }

    async fn recv(&mut self) -> Result<ReplicaResponse> {
        self.transport.resolve(self.node)?;
        self.responses
            .pop_front()
            .ok_or_else(|| Error::replication("no outstanding replica request"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct LoopbackWriteStream {
    transport: Arc<Loopback>,
    node: NodeId,
    partition: Arc<Partition>,
    answers: VecDeque<Result<()>>,
}

#[async_trait]
impl WriteStream for LoopbackWriteStream {
    async fn send(&mut self, record: &[u8]) -> Result<()> {
        self.transport.resolve(self.node)?;
        let answer = self.partition.write_log(record).map(|_| ());
        self.answers.push_back(answer);
        Ok(())
    }

    async fn recv(&mut self) -> Result<()> {
        self.transport.resolve(self.node)?;
        self.answers
            .pop_front()
            .unwrap_or_else(|| Err(Error::replication("no outstanding write request")))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
