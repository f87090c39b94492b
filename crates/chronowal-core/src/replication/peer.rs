//! Runner loop driving one replicator
//!
//! ```text
//! while running:
//!     if replicator.is_ready():
//!         seq = group.consume_wait(idle)   (wakes on append)
//!         replicator.replica(seq, queue.get(seq))
//!         if delivered and not failed: continue
//!     sleep(idle)
//! ```
//!
//! Cancellation only interrupts idle waits. A delivery that started always
//! finishes before the loop checks the running flag again.

use crate::metrics;
use crate::replication::replicator::{Replicator, ReplicatorState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Owns the task that drives a [`Replicator`]
pub struct ReplicatorPeer {
    replicator: Arc<dyn Replicator>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatorPeer {
    /// Wrap a replicator; nothing runs until [`start`](Self::start)
    pub fn new(replicator: Arc<dyn Replicator>) -> Self {
        Self {
            replicator,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Driven replicator
    pub fn replicator(&self) -> &Arc<dyn Replicator> {
        &self.replicator
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the loop on the current runtime. Calling it again is a no-op.
    pub fn start(&self, idle: Duration, span: tracing::Span) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let replicator = self.replicator.clone();
        let running = self.running.clone();
        let cancel = self.cancel.clone();
        let follower = replicator.channel().follower();
        let task = async move {
            tracing::debug!(%follower, "replicator peer started");
            run(replicator, running, cancel, idle).await;
            tracing::debug!(%follower, "replicator peer stopped");
        };
        *self.handle.lock() = Some(tokio::spawn(task.instrument(span)));
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("replicator peer task failed: {}", e);
            }
        }
        self.replicator.close().await;
    }
}

async fn run(
    replicator: Arc<dyn Replicator>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    idle: Duration,
) {
    let channel = replicator.channel();
    while running.load(Ordering::Acquire) {
        metrics::set(&channel.stats().pending, channel.pending());

        if replicator.is_ready().await {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                seq = channel.consume_wait(idle) => seq,
            };
            if let Some(seq) = next {
                match channel.message(seq) {
                    Ok(data) => replicator.replica(seq, &data).await,
                    Err(e) => replicator.skip(seq, &e),
                }
                if replicator.state() != ReplicatorState::Failure {
                    continue;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

impl std::fmt::Debug for ReplicatorPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorPeer")
            .field("channel", self.replicator.channel())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::metrics::{QueueStats, ReplicatorStats};
    use crate::queue::FanOutQueue;
    use crate::replication::replicator::RemoteReplicator;
    use crate::testing::{RecordingTransport, StaticStateManager, TestContext};
    use crate::types::{NodeId, PartitionKey, ShardId};
    use std::time::Instant;

    fn open_fanout(ctx: &TestContext) -> Arc<FanOutQueue> {
        let config = QueueConfig::default()
            .with_data_page_size(1 << 16)
            .with_max_message_size(1 << 10);
        Arc::new(FanOutQueue::open(ctx.path(), config, Arc::new(QueueStats::default())).unwrap())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_peer_replicates_and_shuts_down() {
        let ctx = TestContext::new();
        let fanout = open_fanout(&ctx);
        let state = Arc::new(StaticStateManager::new());
        state.set_online(NodeId(2), "127.0.0.1:7002".parse().unwrap());
        let transport = Arc::new(RecordingTransport::new());
        transport.auto_ack(true);

        let replicator = Arc::new(
            RemoteReplicator::new(
                PartitionKey::new("db", ShardId(1), 0, NodeId(1)),
                NodeId(2),
                fanout.clone(),
                transport.clone(),
                state,
                Arc::new(ReplicatorStats::default()),
                Duration::from_millis(20),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let group = replicator.channel().consumer_group().clone();

        let peer = ReplicatorPeer::new(replicator.clone());
        peer.start(Duration::from_millis(10), tracing::Span::none());
        peer.start(Duration::from_millis(10), tracing::Span::none());
        assert!(peer.is_running());

        for i in 0..5 {
            fanout.put(format!("m{}", i).as_bytes()).unwrap();
        }
        assert!(wait_until(|| group.acknowledged_seq() == 4).await);
        assert_eq!(transport.sent(), vec![0, 1, 2, 3, 4]);
        assert_eq!(replicator.state(), ReplicatorState::Ready);

        peer.shutdown().await;
        peer.shutdown().await;
        assert!(!peer.is_running());

        fanout.put(b"after").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(group.acknowledged_seq(), 4);
    }

    #[tokio::test]
    async fn test_peer_recovers_after_failure() {
        let ctx = TestContext::new();
        let fanout = open_fanout(&ctx);
        let state = Arc::new(StaticStateManager::new());
        state.set_online(NodeId(2), "127.0.0.1:7002".parse().unwrap());
        let transport = Arc::new(RecordingTransport::new());

        let replicator = Arc::new(
            RemoteReplicator::new(
                PartitionKey::new("db", ShardId(1), 0, NodeId(1)),
                NodeId(2),
                fanout.clone(),
                transport.clone(),
                state,
                Arc::new(ReplicatorStats::default()),
                Duration::from_millis(20),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let group = replicator.channel().consumer_group().clone();
        fanout.put(b"m0").unwrap();
        fanout.put(b"m1").unwrap();

        // Deliveries get no response and fail until the follower answers.
        let peer = ReplicatorPeer::new(replicator.clone());
        peer.start(Duration::from_millis(10), tracing::Span::none());
        assert!(wait_until(|| replicator.channel().stats().snapshot().receive_failures > 0).await);
        assert_eq!(group.acknowledged_seq(), -1);

        transport.auto_ack(true);
        assert!(wait_until(|| group.acknowledged_seq() == 1).await);
        assert!(replicator.channel().stats().snapshot().handshakes >= 2);
        peer.shutdown().await;
    }
}
