//! RPC transport between nodes
//!
//! The replicators only see the narrow [`RpcTransport`] / [`ReplicaStream`] /
//! [`WriteStream`] interfaces. [`TcpTransport`] implements them over plain TCP
//! with the framing from [`super::protocol`]; unary calls use a short-lived
//! connection, streams keep theirs open until closed.

use crate::replication::protocol::{
    IndexRequest, Message, ReplicaResponse, ReplicaState, WriteState, write_ack_error,
};
use crate::types::Node;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Leader side of a replica stream
#[async_trait]
pub trait ReplicaStream: Send {
    /// Send the record proposed at `replica_index`
    async fn send(&mut self, replica_index: i64, record: &[u8]) -> Result<()>;

    /// Receive the follower's answer to the oldest unanswered send
    async fn recv(&mut self) -> Result<ReplicaResponse>;

    /// Close the stream
    async fn close(&mut self) -> Result<()>;
}

/// Client side of a leader write stream
#[async_trait]
pub trait WriteStream: Send {
    /// Send one compressed chunk
    async fn send(&mut self, record: &[u8]) -> Result<()>;

    /// Wait for the leader's answer to the oldest unanswered send. A chunk
    /// the leader can never accept fails with [`Error::Rejected`].
    async fn recv(&mut self) -> Result<()>;

    /// Close the stream
    async fn close(&mut self) -> Result<()>;
}

/// Node-to-node calls used by replication and ingestion
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Last index the follower appended for the log
    async fn get_replica_ack_index(&self, node: &Node, request: &IndexRequest) -> Result<i64>;

    /// Make the follower continue at `append_index`
    async fn reset_index(&self, node: &Node, request: &IndexRequest, append_index: i64) -> Result<()>;

    /// Open a replica stream to `node`
    async fn open_replica_stream(&self, node: &Node, state: &ReplicaState) -> Result<Box<dyn ReplicaStream>>;

    /// Open a write stream to the leader `node`
    async fn open_write_stream(&self, node: &Node, state: &WriteState) -> Result<Box<dyn WriteStream>>;
}

/// TCP implementation of [`RpcTransport`]
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    /// Create a transport whose connects and round trips time out after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, node: &Node) -> Result<TcpStream> {
        let stream = with_timeout(self.timeout, TcpStream::connect(node.addr)).await??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn call(&self, node: &Node, request: Message) -> Result<Message> {
        let mut stream = self.connect(node).await?;
        with_timeout(self.timeout, async {
            request.write_to(&mut stream).await?;
            Message::read_from(&mut stream).await?.into_result()
        })
        .await?
    }

    async fn open(&self, node: &Node, request: Message) -> Result<TcpStream> {
        let mut stream = self.connect(node).await?;
        let response = with_timeout(self.timeout, async {
            request.write_to(&mut stream).await?;
            Message::read_from(&mut stream).await?.into_result()
        })
        .await??;

        match response {
            Message::StreamReady { err: None } => Ok(stream),
            Message::StreamReady { err: Some(err) } => Err(Error::replication(err)),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn get_replica_ack_index(&self, node: &Node, request: &IndexRequest) -> Result<i64> {
        match self.call(node, Message::GetReplicaAckIndex(request.clone())).await? {
            Message::ReplicaAckIndex { ack_index } => Ok(ack_index),
            other => Err(unexpected(&other)),
        }
    }

    async fn reset_index(&self, node: &Node, request: &IndexRequest, append_index: i64) -> Result<()> {
        let message = Message::ResetIndex {
            request: request.clone(),
            append_index,
        };
        match self.call(node, message).await? {
            Message::ResetIndexAck { err: None } => Ok(()),
            Message::ResetIndexAck { err: Some(err) } => Err(Error::replication(err)),
            other => Err(unexpected(&other)),
        }
    }

    async fn open_replica_stream(&self, node: &Node, state: &ReplicaState) -> Result<Box<dyn ReplicaStream>> {
        let stream = self
            .open(node, Message::OpenReplica { state: state.to_json()? })
            .await?;
        Ok(Box::new(TcpReplicaStream {
            stream,
            timeout: self.timeout,
        }))
    }

    async fn open_write_stream(&self, node: &Node, state: &WriteState) -> Result<Box<dyn WriteStream>> {
        let stream = self
            .open(node, Message::OpenWrite { state: state.to_json()? })
            .await?;
        Ok(Box::new(TcpWriteStream {
            stream,
            timeout: self.timeout,
        }))
    }
}

struct TcpReplicaStream {
    stream: TcpStream,
    timeout: Duration,
}

#[async_trait]
impl ReplicaStream for TcpReplicaStream {
    async fn send(&mut self, replica_index: i64, record: &[u8]) -> Result<()> {
        let message = Message::Replica {
            replica_index,
            record: record.to_vec(),
        };
        with_timeout(self.timeout, message.write_to(&mut self.stream)).await?
    }

    async fn recv(&mut self) -> Result<ReplicaResponse> {
        match with_timeout(self.timeout, Message::read_from(&mut self.stream)).await??.into_result()? {
            Message::ReplicaAck(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.shutdown().await?;
        Ok(())
    }
}

struct TcpWriteStream {
    stream: TcpStream,
    timeout: Duration,
}

#[async_trait]
impl WriteStream for TcpWriteStream {
    async fn send(&mut self, record: &[u8]) -> Result<()> {
        let message = Message::Write {
            record: record.to_vec(),
        };
        with_timeout(self.timeout, message.write_to(&mut self.stream)).await?
    }

    async fn recv(&mut self) -> Result<()> {
        match with_timeout(self.timeout, Message::read_from(&mut self.stream)).await??.into_result()? {
            Message::WriteAck { err: None, .. } => Ok(()),
            Message::WriteAck {
                err: Some(err),
                retryable,
            } => Err(write_ack_error(err, retryable)),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Run `future` with a deadline, mapping expiry to a retryable replication error
pub(crate) async fn with_timeout<F: std::future::Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::replication(format!("timed out after {:?}", timeout)))
}

fn unexpected(message: &Message) -> Error {
    Error::protocol(format!("unexpected {:?} response", message.message_type()))
}
