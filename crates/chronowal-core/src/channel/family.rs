//! Per-family ingestion buffer
//!
//! Writers append rows to a shared [`Chunk`]; a full chunk is compressed and
//! handed to the write task over a bounded channel, which blocks writers when
//! delivery falls behind. The write task also flushes partial chunks older
//! than the batch timeout, redelivers failed chunks from a bounded retry
//! queue (dropping the oldest when it overflows) and swaps its sink when the
//! shard leader changes. A chunk the write path refuses with a
//! non-retryable error is dropped so the chunks behind it keep flowing.

use crate::channel::chunk::Chunk;
use crate::channel::sink::{WriteSink, WriteSinkFactory};
use crate::config::ChannelConfig;
use crate::metrics::{self, ChannelStats};
use crate::replication::protocol::WriteState;
use crate::types::{BrokerRow, FamilyTime, NodeId, ShardId};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

struct Buffer {
    chunk: Chunk,
    since: Option<Instant>,
}

impl Buffer {
    fn take(&mut self, stats: &ChannelStats) -> Result<Bytes> {
        self.since = None;
        let compressed = self.chunk.compress()?;
        metrics::incr(&stats.flushed_chunks);
        Ok(compressed)
    }
}

/// Buffers rows of one (database, shard, family) and ships them to the leader
pub struct FamilyChannel {
    database: String,
    shard_id: ShardId,
    family_time: FamilyTime,
    buffer: Arc<Mutex<Buffer>>,
    chunks: mpsc::Sender<Bytes>,
    leader: watch::Sender<NodeId>,
    stats: Arc<ChannelStats>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl FamilyChannel {
    /// Create the channel and spawn its write task on the current runtime
    pub fn start(
        database: impl Into<String>,
        shard_id: ShardId,
        family_time: FamilyTime,
        leader: NodeId,
        config: Arc<ChannelConfig>,
        factory: Arc<dyn WriteSinkFactory>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        let database = database.into();
        let buffer = Arc::new(Mutex::new(Buffer {
            chunk: Chunk::new(config.batch_size),
            since: None,
        }));
        let (chunk_tx, chunk_rx) = mpsc::channel(config.channel_buffer);
        let (leader_tx, leader_rx) = watch::channel(leader);
        let cancel = CancellationToken::new();

        let task = WriteTask {
            database: database.clone(),
            shard_id,
            family_time,
            buffer: buffer.clone(),
            chunks: chunk_rx,
            leader: leader_rx,
            factory,
            config,
            stats: stats.clone(),
            sink: None,
            pending: VecDeque::new(),
        };
        let span = tracing::debug_span!(
            "family_channel",
            database = %database,
            shard = %shard_id,
            family_time,
        );
        let handle = tokio::spawn(task.run(cancel.clone()).instrument(span));

        Self {
            database,
            shard_id,
            family_time,
            buffer,
            chunks: chunk_tx,
            leader: leader_tx,
            stats,
            cancel,
            handle: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Family time bucket
    pub fn family_time(&self) -> FamilyTime {
        self.family_time
    }

    /// Leader chunks are currently sent to
    pub fn leader(&self) -> NodeId {
        *self.leader.borrow()
    }

    /// Whether [`stop`](Self::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Buffer `rows`; waits when the write task is behind
    pub async fn write(&self, rows: &[BrokerRow]) -> Result<()> {
        if self.is_stopped() {
            return Err(self.closed());
        }

        let full = {
            let mut buffer = self.buffer.lock();
            let mut full = Vec::new();
            for row in rows {
                buffer.chunk.append(row);
                buffer.since.get_or_insert_with(Instant::now);
                if buffer.chunk.is_full() {
                    match buffer.take(&self.stats) {
                        Ok(chunk) => full.push(chunk),
                        Err(e) => {
                            metrics::incr(&self.stats.compression_failures);
                            tracing::error!(database = %self.database, shard = %self.shard_id, "dropping chunk: {}", e);
                        }
                    }
                }
            }
            full
        };
        metrics::add(&self.stats.written_rows, rows.len() as u64);

        for chunk in full {
            self.chunks.send(chunk).await.map_err(|_| self.closed())?;
        }
        Ok(())
    }

    /// Send future chunks to `leader`
    pub fn notify_leader_change(&self, leader: NodeId) {
        self.leader.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader;
            true
        });
    }

    /// Flush buffered rows and stop the write task, waiting at most
    /// `timeout`. Returns false when the task did not finish in time.
    /// Idempotent.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.stopped.store(true, Ordering::Release);
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(database = %self.database, shard = %self.shard_id, "family write task failed: {}", e);
                true
            }
            Err(_) => {
                tracing::warn!(
                    database = %self.database,
                    shard = %self.shard_id,
                    family_time = self.family_time,
                    ?timeout,
                    "family write task did not stop in time"
                );
                false
            }
        }
    }

    fn closed(&self) -> Error {
        Error::closed(format!(
            "family channel {}/{}/{}",
            self.database, self.shard_id, self.family_time
        ))
    }
}

impl std::fmt::Debug for FamilyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyChannel")
            .field("database", &self.database)
            .field("shard_id", &self.shard_id)
            .field("family_time", &self.family_time)
            .field("leader", &self.leader())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct WriteTask {
    database: String,
    shard_id: ShardId,
    family_time: FamilyTime,
    buffer: Arc<Mutex<Buffer>>,
    chunks: mpsc::Receiver<Bytes>,
    leader: watch::Receiver<NodeId>,
    factory: Arc<dyn WriteSinkFactory>,
    config: Arc<ChannelConfig>,
    stats: Arc<ChannelStats>,
    sink: Option<Box<dyn WriteSink>>,
    pending: VecDeque<Bytes>,
}

impl WriteTask {
    async fn run(mut self, cancel: CancellationToken) {
        let period = (self.config.batch_timeout / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = self.leader.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.switch_leader().await;
                }
                chunk = self.chunks.recv() => match chunk {
                    Some(chunk) => {
                        self.enqueue(chunk);
                        self.deliver().await;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush_expired();
                    if !self.pending.is_empty() {
                        metrics::incr(&self.stats.retries);
                        self.deliver().await;
                    }
                }
            }
        }

        self.drain().await;
    }

    fn write_state(&self) -> WriteState {
        WriteState {
            database: self.database.clone(),
            shard_id: self.shard_id,
            leader: *self.leader.borrow(),
            family_time: self.family_time,
        }
    }

    fn enqueue(&mut self, chunk: Bytes) {
        if self.pending.len() >= self.config.max_retry_buffer.max(1) {
            self.pending.pop_front();
            metrics::incr(&self.stats.retry_drops);
            metrics::adjust(&self.stats.pending_chunks, -1);
            tracing::warn!(
                max_retry_buffer = self.config.max_retry_buffer,
                "retry buffer full, dropped oldest chunk"
            );
        }
        self.pending.push_back(chunk);
        metrics::adjust(&self.stats.pending_chunks, 1);
    }

    fn flush_expired(&mut self) {
        let flushed = {
            let mut buffer = self.buffer.lock();
            match buffer.since {
                Some(since) if since.elapsed() >= self.config.batch_timeout => buffer.take(&self.stats),
                _ => return,
            }
        };
        match flushed {
            Ok(chunk) => self.enqueue(chunk),
            Err(e) => {
                metrics::incr(&self.stats.compression_failures);
                tracing::error!("dropping partial chunk: {}", e);
            }
        }
    }

    async fn switch_leader(&mut self) {
        let leader = *self.leader.borrow_and_update();
        metrics::incr(&self.stats.leader_changes);
        tracing::info!(%leader, "leader changed, switching write sink");
        self.close_sink().await;
    }

    async fn close_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(leader = %sink.leader(), "closing write sink: {}", e);
            }
        }
    }

    /// Send pending chunks in order until one fails with a retryable error
    async fn deliver(&mut self) {
        while let Some(chunk) = self.pending.front().cloned() {
            if self.sink.is_none() {
                let state = self.write_state();
                match self.factory.create(&state).await {
                    Ok(sink) => self.sink = Some(sink),
                    Err(e) => {
                        metrics::incr(&self.stats.send_failures);
                        tracing::warn!(leader = %state.leader, "cannot open write sink: {}", e);
                        return;
                    }
                }
            }
            let Some(sink) = self.sink.as_mut() else {
                return;
            };

            match sink.write(&chunk).await {
                Ok(()) => {
                    self.pending.pop_front();
                    metrics::incr(&self.stats.send_successes);
                    metrics::adjust(&self.stats.pending_chunks, -1);
                }
                Err(e) if !e.is_retryable() => {
                    self.pending.pop_front();
                    metrics::incr(&self.stats.send_failures);
                    metrics::incr(&self.stats.rejected_chunks);
                    metrics::adjust(&self.stats.pending_chunks, -1);
                    tracing::error!(
                        leader = %sink.leader(),
                        size = chunk.len(),
                        "write path refused chunk, dropping it: {}",
                        e
                    );
                }
                Err(e) => {
                    metrics::incr(&self.stats.send_failures);
                    tracing::warn!(leader = %sink.leader(), pending = self.pending.len(), "chunk delivery failed: {}", e);
                    self.close_sink().await;
                    return;
                }
            }
        }
    }

    /// Best-effort flush of everything still buffered
    async fn drain(&mut self) {
        let rest = {
            let mut buffer = self.buffer.lock();
            if buffer.chunk.is_empty() {
                None
            } else {
                Some(buffer.take(&self.stats))
            }
        };
        match rest {
            Some(Ok(chunk)) => self.enqueue(chunk),
            Some(Err(e)) => {
                metrics::incr(&self.stats.compression_failures);
                tracing::error!("dropping partial chunk: {}", e);
            }
            None => {}
        }
        while let Ok(chunk) = self.chunks.try_recv() {
            self.enqueue(chunk);
        }

        self.deliver().await;
        if !self.pending.is_empty() {
            tracing::warn!(chunks = self.pending.len(), "family channel stopped with undelivered chunks");
            metrics::adjust(&self.stats.pending_chunks, -(self.pending.len() as i64));
            self.pending.clear();
        }
        self.close_sink().await;
    }
}
