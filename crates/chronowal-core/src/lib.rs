//! Chronowal Core - Write-Ahead Log and Replication for a Time-Series Database
//!
//! This crate provides the durability and replication core of Chronowal:
//! - Segment-based, memory-mapped fan-out queue with named consumer groups
//! - Per (shard, family) WAL partitions with leader and follower write paths
//! - Leader/follower replication with offset reconciliation handshakes
//! - Ingestion channels that batch, compress and route rows into the WAL
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              ChannelManager                  │
//! │   DatabaseChannel → ShardChannel → Family   │
//! └──────────────┬──────────────────────────────┘
//!                │ compressed chunks (WriteSink)
//! ┌──────────────┴──────────────────────────────┐
//! │               WalManager                     │
//! │   Partition (shard, family, leader)         │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        FanOutQueue + ConsumerGroups          │
//! │     (Queue, Segments, mmap Pages)           │
//! └──────────────┬──────────────────────────────┘
//!                │ one group per follower
//! ┌──────────────┴──────────────────────────────┐
//! │   ReplicatorPeer → Local / Remote Replicator │
//! │   (StorageEngine)    (RpcTransport)         │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod collab;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod replication;
pub mod types;
pub mod wal;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::ChannelManager;
pub use config::{ChannelConfig, QueueConfig, WalConfig};
pub use error::{Error, Result};
pub use replication::ReplicaServer;
pub use types::{BrokerRow, FamilyTime, Node, NodeId, PartitionKey, SEQ_EMPTY, ShardId};
pub use wal::{WalContext, WalManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
