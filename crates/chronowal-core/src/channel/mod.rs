//! Ingestion channels
//!
//! Rows enter through the [`ChannelManager`], are spread over shards with a
//! jump consistent hash and buffered per family time bucket. Each
//! [`FamilyChannel`] runs one task that compresses full or expired chunks
//! and hands them to a [`WriteSink`] pointed at the shard leader:
//!
//! ```text
//! ChannelManager ─► DatabaseChannel ─► ShardChannel ─► FamilyChannel ─► WriteSink
//!                   (evict, hash)      (bucket)        (chunk, retry)   local WAL
//!                                                                       or WriteStream
//! ```

pub mod chunk;
pub mod database;
pub mod family;
pub mod manager;
pub mod shard;
pub mod sink;

pub use chunk::{Chunk, decode_chunk};
pub use database::{DatabaseChannel, JumpHash};
pub use family::FamilyChannel;
pub use manager::ChannelManager;
pub use shard::ShardChannel;
pub use sink::{DefaultWriteSinkFactory, LocalWriteSink, RemoteWriteSink, WriteSink, WriteSinkFactory};
