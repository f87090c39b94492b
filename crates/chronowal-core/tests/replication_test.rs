//! Leader/follower replication between two in-process nodes
//!
//! Both nodes run a full [`WalManager`]; the leader reaches the follower
//! through [`LoopbackTransport`], or through TCP and a [`ReplicaServer`].

use chronowal_core::channel::Chunk;
use chronowal_core::collab::StorageEngine;
use chronowal_core::replication::{RpcTransport, TcpTransport, WriteState};
use chronowal_core::testing::{
    LoopbackTransport, MemoryStorageEngine, StaticStateManager, TestContext, init_tracing,
};
use chronowal_core::{
    BrokerRow, NodeId, PartitionKey, QueueConfig, ReplicaServer, ShardId, WalConfig, WalContext,
    WalManager,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LEADER: NodeId = NodeId(1);
const FOLLOWER: NodeId = NodeId(2);

struct TestNode {
    storage: Arc<MemoryStorageEngine>,
    wal: Arc<WalManager>,
}

fn open_node(
    dir: &Path,
    node: NodeId,
    storage: Arc<MemoryStorageEngine>,
    state: Arc<StaticStateManager>,
    transport: Arc<dyn RpcTransport>,
) -> TestNode {
    let mut config = WalConfig::new(dir)
        .with_queue(
            QueueConfig::default()
                .with_data_page_size(256 * 1024)
                .with_index_page_capacity(64)
                .with_max_message_size(64 * 1024),
        )
        .with_replica_idle(Duration::from_millis(10));
    config.node_wait_timeout = Duration::from_millis(50);
    config.rpc_timeout = Duration::from_secs(2);

    let wal = WalManager::open(WalContext::new(node, config, storage.clone(), state, transport)).unwrap();
    TestNode { storage, wal }
}

fn cluster_state() -> Arc<StaticStateManager> {
    let state = Arc::new(StaticStateManager::new());
    state.set_assignment("db", ShardId(0), LEADER, vec![LEADER, FOLLOWER]);
    state.set_online(LEADER, "127.0.0.1:1".parse().unwrap());
    state.set_online(FOLLOWER, "127.0.0.1:2".parse().unwrap());
    state
}

fn write_state() -> WriteState {
    WriteState {
        database: "db".to_string(),
        shard_id: ShardId(0),
        leader: LEADER,
        family_time: 0,
    }
}

fn key() -> PartitionKey {
    PartitionKey::new("db", ShardId(0), 0, LEADER)
}

/// One compressed chunk holding `rows` rows tagged `batch`
fn chunk(batch: usize, rows: usize) -> Vec<u8> {
    let mut chunk = Chunk::new(1 << 20);
    for i in 0..rows {
        let payload = format!("batch-{}-row-{}", batch, i);
        chunk.append(&BrokerRow::new(i as i64, i as u64, payload.into_bytes()));
    }
    chunk.compress().unwrap().to_vec()
}

fn payloads(storage: &MemoryStorageEngine) -> BTreeSet<Vec<u8>> {
    storage.rows().into_iter().map(|row| row.payload).collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_leader_replicates_to_follower() {
    init_tracing();
    let ctx = TestContext::new();
    let state = cluster_state();
    let transport = LoopbackTransport::new();
    let leader = open_node(
        &ctx.subdir("node-1"),
        LEADER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        Arc::new(transport.clone()),
    );
    let follower = open_node(
        &ctx.subdir("node-2"),
        FOLLOWER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        Arc::new(transport.clone()),
    );
    transport.register(&leader.wal);
    transport.register(&follower.wal);

    let partition = leader.wal.open_write(&write_state()).unwrap();
    assert_eq!(partition.followers(), vec![LEADER, FOLLOWER]);
    for batch in 0..3 {
        assert_eq!(partition.write_log(&chunk(batch, 4)).unwrap(), batch as i64);
    }

    assert!(wait_until(|| leader.storage.rows().len() == 12).await);
    assert!(wait_until(|| follower.storage.rows().len() == 12).await);
    assert_eq!(payloads(&leader.storage), payloads(&follower.storage));

    let replica = follower.wal.get_partition(&key()).expect("follower partition");
    assert_eq!(replica.replica_ack_index(), 2);
    assert_eq!(replica.followers(), vec![FOLLOWER]);
    assert!(wait_until(|| partition.is_drained()).await);
    assert!(wait_until(|| replica.is_drained()).await);
    assert_eq!(follower.storage.committed_seq(&key()), 2);

    leader.wal.close().await.unwrap();
    follower.wal.close().await.unwrap();
}

#[tokio::test]
async fn test_follower_catches_up_after_disconnect() {
    let ctx = TestContext::new();
    let state = cluster_state();
    let transport = LoopbackTransport::new();
    let leader = open_node(
        &ctx.subdir("node-1"),
        LEADER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        Arc::new(transport.clone()),
    );
    let follower = open_node(
        &ctx.subdir("node-2"),
        FOLLOWER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        Arc::new(transport.clone()),
    );
    transport.register(&leader.wal);
    transport.register(&follower.wal);

    let partition = leader.wal.open_write(&write_state()).unwrap();
    partition.write_log(&chunk(0, 5)).unwrap();
    assert!(wait_until(|| follower.storage.rows().len() == 5).await);

    transport.disconnect(FOLLOWER);
    partition.write_log(&chunk(1, 5)).unwrap();
    partition.write_log(&chunk(2, 5)).unwrap();

    // The local replica keeps going while the follower is unreachable.
    assert!(wait_until(|| leader.storage.rows().len() == 15).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(payloads(&follower.storage).len(), 5);
    assert!(!partition.is_drained());

    transport.reconnect(FOLLOWER);
    assert!(wait_until(|| payloads(&follower.storage).len() == 15).await);
    assert_eq!(payloads(&leader.storage), payloads(&follower.storage));
    assert!(wait_until(|| partition.is_drained()).await);

    leader.wal.close().await.unwrap();
    follower.wal.close().await.unwrap();
}

#[tokio::test]
async fn test_follower_recovers_after_restart() {
    let ctx = TestContext::new();
    let state = cluster_state();
    let transport = LoopbackTransport::new();
    let follower_dir = ctx.subdir("node-2");
    let follower_storage = Arc::new(MemoryStorageEngine::new());

    let leader = open_node(
        &ctx.subdir("node-1"),
        LEADER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        Arc::new(transport.clone()),
    );
    transport.register(&leader.wal);

    let follower = open_node(
        &follower_dir,
        FOLLOWER,
        follower_storage.clone(),
        state.clone(),
        Arc::new(transport.clone()),
    );
    transport.register(&follower.wal);

    let partition = leader.wal.open_write(&write_state()).unwrap();
    partition.write_log(&chunk(0, 3)).unwrap();
    partition.write_log(&chunk(1, 3)).unwrap();
    assert!(wait_until(|| payloads(&follower_storage).len() == 6).await);

    follower.wal.close().await.unwrap();
    drop(follower);

    partition.write_log(&chunk(2, 3)).unwrap();
    partition.write_log(&chunk(3, 3)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let follower = open_node(
        &follower_dir,
        FOLLOWER,
        follower_storage.clone(),
        state.clone(),
        Arc::new(transport.clone()),
    );
    transport.register(&follower.wal);
    let replica = follower.wal.get_partition(&key()).expect("recovered partition");
    assert!(replica.replica_ack_index() >= 1);

    assert!(wait_until(|| payloads(&follower_storage).len() == 12).await);
    assert!(wait_until(|| replica.replica_ack_index() == 3).await);
    assert!(wait_until(|| partition.is_drained()).await);

    leader.wal.close().await.unwrap();
    follower.wal.close().await.unwrap();
}

#[tokio::test]
async fn test_replication_over_tcp() {
    let ctx = TestContext::new();
    let state = Arc::new(StaticStateManager::new());
    state.set_assignment("db", ShardId(0), LEADER, vec![LEADER, FOLLOWER]);
    let transport: Arc<dyn RpcTransport> = Arc::new(TcpTransport::new(Duration::from_secs(2)));

    let follower = open_node(
        &ctx.subdir("node-2"),
        FOLLOWER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        transport.clone(),
    );
    let server = ReplicaServer::new(follower.wal.clone());
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    state.set_online(FOLLOWER, addr);

    let leader = open_node(
        &ctx.subdir("node-1"),
        LEADER,
        Arc::new(MemoryStorageEngine::new()),
        state.clone(),
        transport,
    );
    let partition = leader.wal.open_write(&write_state()).unwrap();
    for batch in 0..4 {
        partition.write_log(&chunk(batch, 2)).unwrap();
    }

    assert!(wait_until(|| follower.storage.rows().len() == 8).await);
    assert!(wait_until(|| leader.storage.rows().len() == 8).await);
    assert_eq!(payloads(&leader.storage), payloads(&follower.storage));
    assert!(wait_until(|| partition.is_drained()).await);

    leader.wal.close().await.unwrap();
    server.shutdown().await;
    follower.wal.close().await.unwrap();
}
