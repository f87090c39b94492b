//! Delivery targets of compressed chunks
//!
//! A family channel writes to the WAL of the shard leader. When the leader
//! is this node the chunk goes straight into the partition; otherwise it
//! travels over a write stream to the leader.

use crate::collab::StateManager;
use crate::replication::protocol::WriteState;
use crate::replication::transport::{RpcTransport, WriteStream};
use crate::types::NodeId;
use crate::wal::{Partition, WalManager};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Writes chunks to one leader's WAL
#[async_trait]
pub trait WriteSink: Send {
    /// Leader the chunks go to
    fn leader(&self) -> NodeId;

    /// Durably queue one compressed chunk on the leader
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;
}

/// Creates a sink for a (database, shard, family, leader)
#[async_trait]
pub trait WriteSinkFactory: Send + Sync {
    /// Open a sink for `state`
    async fn create(&self, state: &WriteState) -> Result<Box<dyn WriteSink>>;
}

/// Sink into a partition owned by this node
pub struct LocalWriteSink {
    partition: Arc<Partition>,
}

impl LocalWriteSink {
    /// Wrap a partition
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl WriteSink for LocalWriteSink {
    fn leader(&self) -> NodeId {
        self.partition.key().leader
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.partition.write_log(chunk).map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sink over a write stream to a remote leader
pub struct RemoteWriteSink {
    leader: NodeId,
    stream: Box<dyn WriteStream>,
}

impl RemoteWriteSink {
    /// Wrap an open stream
    pub fn new(leader: NodeId, stream: Box<dyn WriteStream>) -> Self {
        Self { leader, stream }
    }
}

#[async_trait]
impl WriteSink for RemoteWriteSink {
    fn leader(&self) -> NodeId {
        self.leader
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.stream.send(chunk).await?;
        self.stream.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close().await
    }
}

/// Picks the local or remote sink depending on who leads
pub struct DefaultWriteSinkFactory {
    wal: Arc<WalManager>,
    transport: Arc<dyn RpcTransport>,
    state_manager: Arc<dyn StateManager>,
}

impl DefaultWriteSinkFactory {
    /// Create a factory writing locally through `wal`
    pub fn new(
        wal: Arc<WalManager>,
        transport: Arc<dyn RpcTransport>,
        state_manager: Arc<dyn StateManager>,
    ) -> Self {
        Self {
            wal,
            transport,
            state_manager,
        }
    }
}

#[async_trait]
impl WriteSinkFactory for DefaultWriteSinkFactory {
    async fn create(&self, state: &WriteState) -> Result<Box<dyn WriteSink>> {
        if state.leader == self.wal.current_node() {
            let partition = self.wal.open_write(state)?;
            return Ok(Box::new(LocalWriteSink::new(partition)));
        }

        let node = self
            .state_manager
            .get_live_node(state.leader)
            .ok_or_else(|| Error::channel(format!("leader {} is offline", state.leader)))?;
        let stream = self.transport.open_write_stream(&node, state).await?;
        Ok(Box::new(RemoteWriteSink::new(state.leader, stream)))
    }
}
