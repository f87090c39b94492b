//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]
//!
//! Stream metadata ([`ReplicaState`], [`WriteState`]) travels as JSON inside
//! the opening message so it stays readable in logs and across versions.

use crate::types::{FamilyTime, NodeId, PartitionKey, ShardId};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_SIZE: usize = 5;
const CRC_SIZE: usize = 4;

/// Wire message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Open a replica stream
    OpenReplica = 0x01,
    /// Open a leader write stream
    OpenWrite = 0x02,
    /// Stream open response
    StreamReady = 0x03,
    /// Query a follower's ack index
    GetReplicaAckIndex = 0x10,
    /// Ack index response
    ReplicaAckIndex = 0x11,
    /// Reset a follower's append index
    ResetIndex = 0x12,
    /// Reset response
    ResetIndexAck = 0x13,
    /// One replicated record
    Replica = 0x20,
    /// Replicated record acknowledgment
    ReplicaAck = 0x21,
    /// One compressed chunk for the leader
    Write = 0x30,
    /// Write acknowledgment
    WriteAck = 0x31,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::OpenReplica),
            0x02 => Ok(Self::OpenWrite),
            0x03 => Ok(Self::StreamReady),
            0x10 => Ok(Self::GetReplicaAckIndex),
            0x11 => Ok(Self::ReplicaAckIndex),
            0x12 => Ok(Self::ResetIndex),
            0x13 => Ok(Self::ResetIndexAck),
            0x20 => Ok(Self::Replica),
            0x21 => Ok(Self::ReplicaAck),
            0x30 => Ok(Self::Write),
            0x31 => Ok(Self::WriteAck),
            0xFF => Ok(Self::Error),
            _ => Err(Error::protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// Metadata of a replica stream (one leader → follower edge)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Database name
    pub database: String,
    /// Shard
    pub shard_id: ShardId,
    /// Leader node
    pub leader: NodeId,
    /// Follower node
    pub follower: NodeId,
    /// Family time bucket
    pub family_time: FamilyTime,
}

impl ReplicaState {
    /// Partition the edge replicates
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.database.clone(), self.shard_id, self.family_time, self.leader)
    }

    /// Edge of `key` towards `follower`
    pub fn for_edge(key: &PartitionKey, follower: NodeId) -> Self {
        Self {
            database: key.database.clone(),
            shard_id: key.shard_id,
            leader: key.leader,
            follower,
            family_time: key.family_time,
        }
    }

    /// Encode as JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::protocol(format!("encode replica state: {}", e)))
    }

    /// Decode from JSON
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::protocol(format!("decode replica state: {}", e)))
    }
}

/// Metadata of a leader write stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteState {
    /// Database name
    pub database: String,
    /// Shard
    pub shard_id: ShardId,
    /// Leader receiving the writes
    pub leader: NodeId,
    /// Family time bucket
    pub family_time: FamilyTime,
}

impl WriteState {
    /// Partition written to
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.database.clone(), self.shard_id, self.family_time, self.leader)
    }

    /// Encode as JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::protocol(format!("encode write state: {}", e)))
    }

    /// Decode from JSON
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::protocol(format!("decode write state: {}", e)))
    }
}

/// Identifies the follower-side log addressed by an index RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Database name
    pub database: String,
    /// Shard
    pub shard_id: ShardId,
    /// Leader of the log
    pub leader: NodeId,
    /// Family time bucket
    pub family_time: FamilyTime,
}

impl IndexRequest {
    /// Partition addressed
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.database.clone(), self.shard_id, self.family_time, self.leader)
    }
}

impl From<&PartitionKey> for IndexRequest {
    fn from(key: &PartitionKey) -> Self {
        Self {
            database: key.database.clone(),
            shard_id: key.shard_id,
            leader: key.leader,
            family_time: key.family_time,
        }
    }
}

/// Follower response to one replicated record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    /// Index the leader proposed
    pub replica_index: i64,
    /// Index the follower actually holds
    pub ack_index: i64,
    /// Rejection reason
    pub err: Option<String>,
}

/// Wire messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Open a replica stream; `state` is a JSON [`ReplicaState`]
    OpenReplica { state: String },

    /// Open a write stream; `state` is a JSON [`WriteState`]
    OpenWrite { state: String },

    /// Result of opening a stream
    StreamReady { err: Option<String> },

    /// Query the follower's last appended index for a log
    GetReplicaAckIndex(IndexRequest),

    /// Follower's last appended index
    ReplicaAckIndex { ack_index: i64 },

    /// Make the follower continue appending at `append_index`
    ResetIndex {
        /// Log to reset
        request: IndexRequest,
        /// Next sequence the follower will accept
        append_index: i64,
    },

    /// Result of a reset
    ResetIndexAck { err: Option<String> },

    /// Record proposed at `replica_index`
    Replica { replica_index: i64, record: Vec<u8> },

    /// Follower answer to [`Message::Replica`]
    ReplicaAck(ReplicaResponse),

    /// Compressed chunk for the leader's log
    Write { record: Vec<u8> },

    /// Result of a write; `retryable` tells the writer whether resending
    /// the same chunk can succeed
    WriteAck { err: Option<String>, retryable: bool },

    /// Error message
    Error { message: String },
}

impl Message {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::OpenReplica { .. } => MessageType::OpenReplica,
            Self::OpenWrite { .. } => MessageType::OpenWrite,
            Self::StreamReady { .. } => MessageType::StreamReady,
            Self::GetReplicaAckIndex(_) => MessageType::GetReplicaAckIndex,
            Self::ReplicaAckIndex { .. } => MessageType::ReplicaAckIndex,
            Self::ResetIndex { .. } => MessageType::ResetIndex,
            Self::ResetIndexAck { .. } => MessageType::ResetIndexAck,
            Self::Replica { .. } => MessageType::Replica,
            Self::ReplicaAck(_) => MessageType::ReplicaAck,
            Self::Write { .. } => MessageType::Write,
            Self::WriteAck { .. } => MessageType::WriteAck,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds limit {}",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE + CRC_SIZE {
            return Err(Error::protocol("Message too short"));
        }

        let crc_offset = buf.len() - CRC_SIZE;
        let stored_crc = le_u32(&buf[crc_offset..]);
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let kind = MessageType::try_from(buf[0])?;
        let length = le_u32(&buf[1..HEADER_SIZE]) as usize;
        if buf.len() != HEADER_SIZE + length + CRC_SIZE {
            return Err(Error::protocol("Incomplete message"));
        }

        let message: Self = bincode::deserialize(&buf[HEADER_SIZE..HEADER_SIZE + length])
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))?;
        if message.message_type() != kind {
            return Err(Error::protocol(format!(
                "type byte {:?} does not match payload {:?}",
                kind,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let length = le_u32(&header[1..]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds limit {}",
                length, MAX_FRAME_SIZE
            )));
        }

        let mut full = vec![0u8; HEADER_SIZE + length + CRC_SIZE];
        full[..HEADER_SIZE].copy_from_slice(&header);
        reader.read_exact(&mut full[HEADER_SIZE..]).await?;

        Self::decode(&full)
    }

    /// Acknowledgment for the outcome of a leader write
    pub fn write_ack<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::WriteAck {
                err: None,
                retryable: false,
            },
            Err(e) => Self::WriteAck {
                err: Some(e.to_string()),
                retryable: e.is_retryable(),
            },
        }
    }

    /// Turn an [`Message::Error`] into an error, pass anything else through
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error { message } => Err(Error::replication(message)),
            other => Ok(other),
        }
    }
}

/// Writer-side error for a failed [`Message::WriteAck`]
pub fn write_ack_error(err: String, retryable: bool) -> Error {
    if retryable {
        Error::replication(err)
    } else {
        Error::rejected(err)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}
