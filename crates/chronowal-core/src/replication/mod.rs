//! Leader/follower replication of WAL partitions
//!
//! Every partition runs one [`ReplicatorPeer`] per follower, the leader
//! itself included. Each peer drives a [`Replicator`] that reads from the
//! follower's consumer group:
//!
//! ```text
//!                         ┌──────────────────────┐
//!                 ┌──────►│ LocalReplicator      │──► StorageEngine
//! ┌───────────┐   │       └──────────────────────┘
//! │ FanOutQueue│──┤ group "1" (leader)
//! │ (leader)   │  │       ┌──────────────────────┐  Replica stream  ┌──────────┐
//! └───────────┘   └──────►│ RemoteReplicator     │ ───────────────► │ follower │
//!                 group "2"└──────────────────────┘                  │ WAL      │
//!                                                                    └──────────┘
//! ```
//!
//! A remote replicator reconciles offsets with the follower before
//! streaming (see [`replicator`]); the follower appends only the sequence
//! it expects next and replays its own log through a local replicator.
//!
//! # Wire Protocol
//!
//! All messages use bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

pub mod peer;
pub mod protocol;
pub mod replicator;
pub mod server;
pub mod transport;

pub use peer::ReplicatorPeer;
pub use protocol::{IndexRequest, Message, MessageType, ReplicaResponse, ReplicaState, WriteState};
pub use replicator::{LocalReplicator, RemoteReplicator, Replicator, ReplicatorChannel, ReplicatorState};
pub use server::ReplicaServer;
pub use transport::{ReplicaStream, RpcTransport, TcpTransport, WriteStream};
