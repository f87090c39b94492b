//! Named cursor over a [`Queue`]
//!
//! A group persists `consumedSeq` (offset 0) and `acknowledgedSeq` (offset 8)
//! in `consumer_group/<name>/meta`. All offset mutations of one group are
//! serialized by the lock around its meta page; reads go through atomics.
//!
//! Invariant: `acknowledged_seq <= consumed_seq <= queue.appended_seq()`.

use crate::metrics::{self, QueueStats};
use crate::queue::Queue;
use crate::queue::page::MetaPage;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

const META_FILE: &str = "meta";

/// Consumer group over a shared queue
pub struct ConsumerGroup {
    name: String,
    dir: PathBuf,
    queue: Arc<Queue>,
    meta: Mutex<MetaPage>,
    consumed_seq: AtomicI64,
    acknowledged_seq: AtomicI64,
    paused: AtomicBool,
    closed: AtomicBool,
    stats: Arc<QueueStats>,
}

impl ConsumerGroup {
    /// Open or create the group stored in `dir`.
    ///
    /// A new group starts at the queue's acknowledged floor. A recovered group
    /// whose acknowledged sequence fell behind the floor is raised to it.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        name: impl Into<String>,
        queue: Arc<Queue>,
        stats: Arc<QueueStats>,
    ) -> Result<Self> {
        let name = name.into();
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let floor = queue.acknowledged_seq();
        let appended = queue.appended_seq();
        let meta = MetaPage::open(dir.join(META_FILE), (floor, floor))?;
        let (mut consumed, mut acknowledged) = meta.load()?;

        let loaded = (consumed, acknowledged);
        if acknowledged < floor {
            acknowledged = floor;
        }
        consumed = consumed.clamp(acknowledged, appended.max(acknowledged));
        acknowledged = acknowledged.min(consumed);
        if (consumed, acknowledged) != loaded {
            tracing::info!(
                group = %name,
                from_consumed = loaded.0,
                from_acknowledged = loaded.1,
                consumed,
                acknowledged,
                "reconciled consumer group with queue"
            );
            meta.store(consumed, acknowledged)?;
        }

        Ok(Self {
            name,
            dir,
            queue,
            meta: Mutex::new(meta),
            consumed_seq: AtomicI64::new(consumed),
            acknowledged_seq: AtomicI64::new(acknowledged),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Underlying queue
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Highest sequence pulled for processing
    pub fn consumed_seq(&self) -> i64 {
        self.consumed_seq.load(Ordering::Acquire)
    }

    /// Highest sequence confirmed as processed
    pub fn acknowledged_seq(&self) -> i64 {
        self.acknowledged_seq.load(Ordering::Acquire)
    }

    /// Messages appended but not yet consumed
    pub fn pending(&self) -> i64 {
        (self.queue.appended_seq() - self.consumed_seq()).max(0)
    }

    /// Whether everything appended was acknowledged
    pub fn is_empty(&self) -> bool {
        self.queue.appended_seq() <= self.acknowledged_seq()
    }

    /// Take the next sequence, or `None` when no message is available, the
    /// group is paused, or it was closed.
    pub fn consume(&self) -> Option<i64> {
        if self.paused.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return None;
        }

        let meta = self.meta.lock();
        let next = self.consumed_seq() + 1;
        if next > self.queue.appended_seq() {
            return None;
        }
        self.consumed_seq.store(next, Ordering::Release);
        self.persist(&meta);
        Some(next)
    }

    /// Like [`consume`](Self::consume), but suspends up to `timeout` for new
    /// data. Wakes on append, pause, resume and close.
    pub async fn consume_wait(&self, timeout: Duration) -> Option<i64> {
        if let Some(seq) = self.consume() {
            return Some(seq);
        }

        let notified = self.queue.notify().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(seq) = self.consume() {
            return Some(seq);
        }
        if self.is_paused() || self.closed.load(Ordering::Acquire) || self.queue.is_closed() {
            return None;
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        self.consume()
    }

    /// Read the message at `seq` from the queue
    pub fn message(&self, seq: i64) -> Result<Vec<u8>> {
        self.queue.get(seq)
    }

    /// Administrative rewind / fast-forward of the consumed cursor.
    ///
    /// `seq` must lie in `[queue.acknowledged_seq(), queue.appended_seq()]`;
    /// the acknowledged sequence is lowered with it when needed.
    pub fn set_consumed_seq(&self, seq: i64) -> Result<()> {
        let meta = self.meta.lock();
        let floor = self.queue.acknowledged_seq();
        let appended = self.queue.appended_seq();
        if seq < floor || seq > appended {
            return Err(Error::OutOfRange {
                seq,
                first: floor,
                last: appended,
            });
        }

        self.consumed_seq.store(seq, Ordering::Release);
        if self.acknowledged_seq() > seq {
            self.acknowledged_seq.store(seq, Ordering::Release);
        }
        self.persist(&meta);
        tracing::info!(group = %self.name, seq, "set consumed sequence");
        Ok(())
    }

    /// Acknowledge everything up to `seq`.
    ///
    /// Only applies when `seq` lies in `(acknowledged, consumed]`; anything
    /// else is logged and ignored. Returns whether the ack was applied.
    pub fn ack(&self, seq: i64) -> bool {
        let meta = self.meta.lock();
        let acknowledged = self.acknowledged_seq();
        let consumed = self.consumed_seq();
        if seq <= acknowledged || seq > consumed {
            metrics::incr(&self.stats.invalid_acks);
            tracing::warn!(
                group = %self.name,
                seq,
                acknowledged,
                consumed,
                "ignoring out-of-range ack"
            );
            return false;
        }

        self.acknowledged_seq.store(seq, Ordering::Release);
        self.persist(&meta);
        true
    }

    /// Force both cursors to `seq` (queue fast-forward)
    pub(crate) fn reset(&self, seq: i64) {
        let meta = self.meta.lock();
        self.consumed_seq.store(seq, Ordering::Release);
        self.acknowledged_seq.store(seq, Ordering::Release);
        self.persist(&meta);
    }

    fn persist(&self, meta: &MetaPage) {
        if let Err(e) = meta.store(self.consumed_seq(), self.acknowledged_seq()) {
            metrics::incr(&self.stats.metadata_failures);
            tracing::error!(group = %self.name, "failed to persist consumer group meta: {}", e);
        }
    }

    /// Stop handing out sequences and wake waiting consumers
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.queue.notify().notify_waiters();
    }

    /// Resume after [`pause`](Self::pause) and wake waiting consumers
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.queue.notify().notify_waiters();
    }

    /// Whether the group is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Flush the meta page
    pub fn sync(&self) -> Result<()> {
        self.meta.lock().sync()
    }

    /// Flush and stop handing out sequences. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.queue.notify().notify_waiters();
        self.sync()
    }
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("name", &self.name)
            .field("consumed_seq", &self.consumed_seq())
            .field("acknowledged_seq", &self.acknowledged_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::testing::TestContext;
    use crate::types::SEQ_EMPTY;

    fn setup(ctx: &TestContext) -> (Arc<Queue>, ConsumerGroup) {
        let stats = Arc::new(QueueStats::default());
        let config = QueueConfig::default()
            .with_data_page_size(4096)
            .with_max_message_size(1024);
        let queue = Arc::new(Queue::open(ctx.path().join("q"), config, stats.clone()).unwrap());
        let group = ConsumerGroup::open(ctx.path().join("g"), "g", queue.clone(), stats).unwrap();
        (queue, group)
    }

    #[test]
    fn test_consume_and_ack() {
        let ctx = TestContext::new();
        let (queue, group) = setup(&ctx);
        assert_eq!(group.consumed_seq(), SEQ_EMPTY);
        assert_eq!(group.consume(), None);

        queue.put(b"a").unwrap();
        queue.put(b"b").unwrap();
        assert_eq!(group.pending(), 2);

        assert_eq!(group.consume(), Some(0));
        assert_eq!(group.consume(), Some(1));
        assert_eq!(group.consume(), None);
        assert_eq!(group.pending(), 0);
        assert!(!group.is_empty());

        assert!(group.ack(1));
        assert!(group.is_empty());
        assert_eq!(group.acknowledged_seq(), 1);
    }

    #[test]
    fn test_out_of_range_acks_are_ignored() {
        let ctx = TestContext::new();
        let (queue, group) = setup(&ctx);
        for _ in 0..3 {
            queue.put(b"x").unwrap();
        }
        group.consume();
        group.consume();

        assert!(!group.ack(2)); // beyond consumed
        assert!(group.ack(0));
        assert!(!group.ack(0)); // already acked
        assert!(!group.ack(-1));
        assert_eq!(group.acknowledged_seq(), 0);
        assert_eq!(queue.stats().snapshot().invalid_acks, 3);
    }

    #[test]
    fn test_pause_resume() {
        let ctx = TestContext::new();
        let (queue, group) = setup(&ctx);
        queue.put(b"x").unwrap();
        group.pause();
        assert_eq!(group.consume(), None);
        group.resume();
        assert_eq!(group.consume(), Some(0));
    }

    #[test]
    fn test_set_consumed_seq() {
        let ctx = TestContext::new();
        let (queue, group) = setup(&ctx);
        for _ in 0..5 {
            queue.put(b"x").unwrap();
        }
        for _ in 0..4 {
            group.consume();
        }
        group.ack(3);

        group.set_consumed_seq(1).unwrap();
        assert_eq!(group.consumed_seq(), 1);
        assert_eq!(group.acknowledged_seq(), 1);
        assert_eq!(group.consume(), Some(2));

        assert!(group.set_consumed_seq(5).is_err());
        assert!(group.set_consumed_seq(-2).is_err());
    }

    #[test]
    fn test_recovered_group_raised_to_queue_floor() {
        let ctx = TestContext::new();
        let (queue, group) = setup(&ctx);
        for _ in 0..4 {
            queue.put(b"x").unwrap();
        }
        group.consume();
        group.close().unwrap();
        drop(group);

        queue.set_acknowledged_seq(2);
        let group = ConsumerGroup::open(
            ctx.path().join("g"),
            "g",
            queue.clone(),
            queue.stats().clone(),
        )
        .unwrap();
        assert_eq!(group.acknowledged_seq(), 2);
        assert_eq!(group.consumed_seq(), 2);
        assert_eq!(group.consume(), Some(3));
    }

    #[tokio::test]
    async fn test_consume_wait_wakes_on_put() {
        let ctx = TestContext::new();
        let (queue, group) = setup(&ctx);
        let group = Arc::new(group);

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.consume_wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.put(b"late").unwrap();

        assert_eq!(waiter.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_pause_wakes_waiting_consumer() {
        let ctx = TestContext::new();
        let (_queue, group) = setup(&ctx);
        let group = Arc::new(group);

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                let seq = group.consume_wait(Duration::from_secs(30)).await;
                (seq, started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        group.pause();

        let (seq, waited) = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("pause did not wake the consumer")
            .unwrap();
        assert_eq!(seq, None);
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_consume_wait_times_out() {
        let ctx = TestContext::new();
        let (_queue, group) = setup(&ctx);
        assert_eq!(group.consume_wait(Duration::from_millis(20)).await, None);
    }
}
