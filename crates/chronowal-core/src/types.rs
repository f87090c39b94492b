//! Shared identifiers and row types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Sentinel sequence meaning "empty / no data"
pub const SEQ_EMPTY: i64 = -1;

/// Cluster node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(NodeId)
    }
}

/// Shard identifier within a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Start of a family time bucket, in epoch milliseconds
pub type FamilyTime = i64;

/// Truncate a timestamp down to the start of its family bucket
pub fn family_time_of(timestamp: i64, interval_ms: i64) -> FamilyTime {
    if interval_ms <= 0 {
        return timestamp;
    }
    timestamp - timestamp.rem_euclid(interval_ms)
}

/// A live cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID
    pub id: NodeId,
    /// Replication / write endpoint
    pub addr: SocketAddr,
}

/// Leader and replica set of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Current leader
    pub leader: NodeId,
    /// All replicas, leader included
    pub replicas: Vec<NodeId>,
}

/// Identifies one WAL instance: a (shard, family) log written by one leader
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Database name
    pub database: String,
    /// Shard ID
    pub shard_id: ShardId,
    /// Family time bucket
    pub family_time: FamilyTime,
    /// Leader that assigns sequences in this log
    pub leader: NodeId,
}

impl PartitionKey {
    /// Create a partition key
    pub fn new(
        database: impl Into<String>,
        shard_id: ShardId,
        family_time: FamilyTime,
        leader: NodeId,
    ) -> Self {
        Self {
            database: database.into(),
            shard_id,
            family_time,
            leader,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.database, self.shard_id, self.family_time, self.leader
        )
    }
}

/// One ingested row in broker form.
///
/// The payload is produced by a [`crate::collab::MetricConverter`] and is
/// opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRow {
    /// Row timestamp in epoch milliseconds
    pub timestamp: i64,
    /// Hash of the series identity, used for shard routing
    pub series_hash: u64,
    /// Encoded metric
    pub payload: Vec<u8>,
}

impl BrokerRow {
    /// Create a row
    pub fn new(timestamp: i64, series_hash: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            series_hash,
            payload: payload.into(),
        }
    }

    /// Encoded size inside a chunk
    pub fn encoded_len(&self) -> usize {
        8 + 8 + 4 + self.payload.len()
    }
}
