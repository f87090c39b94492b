//! Node-side endpoint of the replication protocol
//!
//! Every connection starts with one request. Unary requests
//! (`GetReplicaAckIndex`, `ResetIndex`) are answered and the connection is
//! dropped; `OpenReplica` and `OpenWrite` turn the connection into a stream
//! that is served until the peer hangs up or the server shuts down.

use crate::replication::protocol::{Message, ReplicaResponse, ReplicaState, WriteState};
use crate::wal::{Partition, WalManager};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Serves replication and write streams for one [`WalManager`]
pub struct ReplicaServer {
    manager: Arc<WalManager>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaServer {
    /// Create a server; nothing is bound until [`bind`](Self::bind)
    pub fn new(manager: Arc<WalManager>) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Bind `addr` and start accepting connections. Returns the bound
    /// address, which differs from `addr` when port 0 was requested.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.cancel.is_cancelled() {
            return Err(Error::closed("replica server"));
        }
        if self.handle.lock().is_some() {
            return Err(Error::replication("replica server already running"));
        }

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(node = %self.manager.current_node(), %local, "replica server listening");

        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        *self.handle.lock() = Some(tokio::spawn(accept_loop(listener, manager, cancel)));
        Ok(local)
    }

    /// Stop accepting and close all open streams. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("replica server task failed: {}", e);
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, manager: Arc<WalManager>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let manager = manager.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, &manager, cancel).await {
                            tracing::debug!(%addr, "replication connection ended: {}", e);
                        }
                    });
                }
                Err(e) => tracing::error!("accept error: {}", e),
            },
            _ = cancel.cancelled() => {
                tracing::info!("replica server shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    manager: &WalManager,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let request = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        request = Message::read_from(&mut stream) => request?,
    };

    match request {
        Message::GetReplicaAckIndex(request) => {
            let response = match manager.replica_ack_index(&request) {
                Ok(ack_index) => Message::ReplicaAckIndex { ack_index },
                Err(e) => Message::Error {
                    message: e.to_string(),
                },
            };
            response.write_to(&mut stream).await
        }
        Message::ResetIndex {
            request,
            append_index,
        } => {
            let err = manager
                .reset_index(&request, append_index)
                .err()
                .map(|e| e.to_string());
            Message::ResetIndexAck { err }.write_to(&mut stream).await
        }
        Message::OpenReplica { state } => {
            let opened = ReplicaState::from_json(&state).and_then(|state| manager.open_replica(&state));
            let Some(partition) = stream_ready(&mut stream, opened).await? else {
                return Ok(());
            };
            serve_replica_stream(stream, &partition, cancel).await
        }
        Message::OpenWrite { state } => {
            let opened = WriteState::from_json(&state).and_then(|state| manager.open_write(&state));
            let Some(partition) = stream_ready(&mut stream, opened).await? else {
                return Ok(());
            };
            serve_write_stream(stream, &partition, cancel).await
        }
        other => {
            let message = format!("unexpected {:?} request", other.message_type());
            Message::Error {
                message: message.clone(),
            }
            .write_to(&mut stream)
            .await?;
            Err(Error::protocol(message))
        }
    }
}

async fn stream_ready(
    stream: &mut TcpStream,
    opened: Result<Arc<Partition>>,
) -> Result<Option<Arc<Partition>>> {
    match opened {
        Ok(partition) => {
            Message::StreamReady { err: None }.write_to(stream).await?;
            Ok(Some(partition))
        }
        Err(e) => {
            tracing::warn!("rejecting stream: {}", e);
            Message::StreamReady {
                err: Some(e.to_string()),
            }
            .write_to(stream)
            .await?;
            Ok(None)
        }
    }
}

async fn serve_replica_stream(
    mut stream: TcpStream,
    partition: &Partition,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = Message::read_from(&mut stream) => message?,
        };
        let Message::Replica {
            replica_index,
            record,
        } = message
        else {
            return Err(Error::protocol(format!(
                "unexpected {:?} on replica stream",
                message.message_type()
            )));
        };

        let response = replica_response(partition, replica_index, &record);
        Message::ReplicaAck(response).write_to(&mut stream).await?;
    }
}

async fn serve_write_stream(
    mut stream: TcpStream,
    partition: &Partition,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = Message::read_from(&mut stream) => message?,
        };
        let Message::Write { record } = message else {
            return Err(Error::protocol(format!(
                "unexpected {:?} on write stream",
                message.message_type()
            )));
        };

        Message::write_ack(&partition.write_log(&record))
            .write_to(&mut stream)
            .await?;
    }
}

/// Apply one replicated record and build the answer for the leader
pub(crate) fn replica_response(partition: &Partition, replica_index: i64, record: &[u8]) -> ReplicaResponse {
    match partition.replica_log(replica_index, record) {
        Ok(ack_index) if ack_index == replica_index => ReplicaResponse {
            replica_index,
            ack_index,
            err: None,
        },
        Ok(expected) => ReplicaResponse {
            replica_index,
            ack_index: expected,
            err: Some(format!("sequence mismatch, expected {}", expected)),
        },
        Err(e) => ReplicaResponse {
            replica_index,
            ack_index: partition.replica_ack_index(),
            err: Some(e.to_string()),
        },
    }
}
