//! Append-only queue built from segments
//!
//! On-disk layout under the queue root:
//!
//! ```text
//! queue.meta      appendedSeq @0, acknowledgedSeq @8
//! segment/        <begin>.idx / <begin>.dat pairs
//! ```
//!
//! `put` is single-writer (serialized by an internal lock); `get`,
//! `appended_seq` and `acknowledged_seq` may run concurrently with it.
//! Advancing the acknowledged sequence hands segment removal to a background
//! cleaner thread; removal failures are logged and never surface to callers.

use crate::config::QueueConfig;
use crate::metrics::{self, QueueStats};
use crate::queue::page::MetaPage;
use crate::queue::segment::{Segment, list_segments};
use crate::types::SEQ_EMPTY;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::Notify;

const META_FILE: &str = "queue.meta";
const SEGMENT_DIR: &str = "segment";
const CLEANER_BUFFER: usize = 16;

type SegmentMap = Arc<RwLock<BTreeMap<i64, Arc<Segment>>>>;

/// Commands sent to the segment cleaner thread
#[derive(Debug)]
enum CleanerCommand {
    /// Remove retired segments whose last sequence is <= the given one
    Remove(i64),
    /// Stop the thread
    Shutdown,
}

struct SegmentCleaner {
    sender: Sender<CleanerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SegmentCleaner {
    fn start(segments: SegmentMap, stats: Arc<QueueStats>, name: String) -> Result<Self> {
        let (sender, receiver) = bounded(CLEANER_BUFFER);
        let handle = thread::Builder::new()
            .name(format!("segment-cleaner-{}", name))
            .spawn(move || Self::run(segments, receiver, stats))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    fn run(segments: SegmentMap, receiver: Receiver<CleanerCommand>, stats: Arc<QueueStats>) {
        while let Ok(command) = receiver.recv() {
            match command {
                CleanerCommand::Remove(acknowledged) => {
                    remove_retired(&segments, acknowledged, &stats);
                }
                CleanerCommand::Shutdown => break,
            }
        }
    }

    fn request(&self, acknowledged: i64) {
        match self.sender.try_send(CleanerCommand::Remove(acknowledged)) {
            Ok(()) => {}
            // A later request covers this one.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("segment cleaner stopped, skipping removal up to {}", acknowledged);
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = self.sender.send(CleanerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("segment cleaner thread panicked");
            }
        }
    }
}

/// Detach every segment except the active one whose range is fully
/// acknowledged, then delete its files.
fn remove_retired(segments: &SegmentMap, acknowledged: i64, stats: &QueueStats) {
    let retired: Vec<Arc<Segment>> = {
        let mut map = segments.write();
        let Some(&active) = map.keys().next_back() else {
            return;
        };
        let begins: Vec<i64> = map
            .iter()
            .filter(|(begin, segment)| **begin != active && segment.end_seq() <= acknowledged)
            .map(|(begin, _)| *begin)
            .collect();
        begins.iter().filter_map(|begin| map.remove(begin)).collect()
    };

    for segment in retired {
        match segment.remove() {
            Ok(()) => {
                metrics::incr(&stats.removed_segments);
                tracing::debug!(
                    begin = segment.begin_seq(),
                    end = segment.end_seq(),
                    "removed acknowledged segment"
                );
            }
            Err(e) => {
                metrics::incr(&stats.cleanup_failures);
                tracing::warn!(begin = segment.begin_seq(), "failed to remove segment: {}", e);
            }
        }
    }
}

/// Append-only sequence of messages
pub struct Queue {
    dir: PathBuf,
    segment_dir: PathBuf,
    config: QueueConfig,
    meta: Mutex<MetaPage>,
    segments: SegmentMap,
    write_lock: Mutex<()>,
    appended_seq: AtomicI64,
    acknowledged_seq: AtomicI64,
    notify: Notify,
    cleaner: Mutex<Option<SegmentCleaner>>,
    closed: AtomicBool,
    stats: Arc<QueueStats>,
}

impl Queue {
    /// Open or create a queue rooted at `dir`
    pub fn open<P: AsRef<Path>>(dir: P, config: QueueConfig, stats: Arc<QueueStats>) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let segment_dir = dir.join(SEGMENT_DIR);
        std::fs::create_dir_all(&segment_dir)?;

        let meta = MetaPage::open(dir.join(META_FILE), (SEQ_EMPTY, SEQ_EMPTY))?;
        let (appended, acknowledged) = meta.load()?;
        if acknowledged > appended {
            return Err(Error::queue(format!(
                "corrupt queue meta {}: acknowledged {} > appended {}",
                dir.display(),
                acknowledged,
                appended
            )));
        }

        let segments = Self::recover_segments(&segment_dir, &config, appended)?;
        let segments: SegmentMap = Arc::new(RwLock::new(segments));
        remove_retired(&segments, acknowledged, &stats);

        let cleaner = SegmentCleaner::start(
            segments.clone(),
            stats.clone(),
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )?;

        tracing::debug!(
            dir = %dir.display(),
            appended,
            acknowledged,
            "opened queue"
        );

        Ok(Self {
            dir,
            segment_dir,
            config,
            meta: Mutex::new(meta),
            segments,
            write_lock: Mutex::new(()),
            appended_seq: AtomicI64::new(appended),
            acknowledged_seq: AtomicI64::new(acknowledged),
            notify: Notify::new(),
            cleaner: Mutex::new(Some(cleaner)),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    fn recover_segments(
        segment_dir: &Path,
        config: &QueueConfig,
        appended: i64,
    ) -> Result<BTreeMap<i64, Arc<Segment>>> {
        let begins = list_segments(segment_dir)?;
        let mut segments = BTreeMap::new();

        for (i, begin) in begins.iter().enumerate() {
            let count = match begins.get(i + 1) {
                Some(next) => next - begin,
                None => appended - begin + 1,
            };
            let segment = Segment::open(segment_dir, *begin, config, count.max(0) as usize)?;
            segments.insert(*begin, Arc::new(segment));
        }

        if segments.is_empty() {
            let begin = appended + 1;
            segments.insert(begin, Arc::new(Segment::open(segment_dir, begin, config, 0)?));
        }
        Ok(segments)
    }

    /// Queue root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequence of the last appended message, `-1` when nothing was appended
    pub fn appended_seq(&self) -> i64 {
        self.appended_seq.load(Ordering::Acquire)
    }

    /// Sequence the next `put` will assign
    pub fn head_seq(&self) -> i64 {
        self.appended_seq() + 1
    }

    /// Highest sequence that may be discarded
    pub fn acknowledged_seq(&self) -> i64 {
        self.acknowledged_seq.load(Ordering::Acquire)
    }

    /// First sequence still readable
    pub fn first_seq(&self) -> i64 {
        self.segments
            .read()
            .values()
            .next()
            .map(|s| s.begin_seq())
            .unwrap_or_else(|| self.head_seq())
    }

    /// Number of live segments
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Statistics handle
    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    /// Append a message and return its sequence
    pub fn put(&self, data: &[u8]) -> Result<i64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!("queue {}", self.dir.display())));
        }
        if data.len() > self.config.max_message_size {
            metrics::incr(&self.stats.put_failures);
            return Err(Error::ExceedingMessageSizeLimit {
                size: data.len(),
                limit: self.config.max_message_size,
            });
        }

        let _writer = self.write_lock.lock();
        let active = self.active_segment(data.len())?;
        let seq = active.append(data)?;
        debug_assert_eq!(seq, self.appended_seq() + 1);

        self.appended_seq.store(seq, Ordering::Release);
        self.persist_meta();
        self.notify.notify_waiters();

        metrics::incr(&self.stats.puts);
        metrics::add(&self.stats.put_bytes, data.len() as u64);
        Ok(seq)
    }

    /// Active segment, rotated when `len` more bytes would not fit
    fn active_segment(&self, len: usize) -> Result<Arc<Segment>> {
        if let Some(active) = self.segments.read().values().next_back() {
            if active.fits(len) {
                return Ok(active.clone());
            }
        }

        let begin = self.appended_seq() + 1;
        let segment = Arc::new(Segment::open(&self.segment_dir, begin, &self.config, 0)?);
        tracing::debug!(dir = %self.dir.display(), begin, "rotated queue segment");
        self.segments.write().insert(begin, segment.clone());
        Ok(segment)
    }

    /// Read the message at `seq`
    pub fn get(&self, seq: i64) -> Result<Vec<u8>> {
        let appended = self.appended_seq();
        let segment = {
            let segments = self.segments.read();
            segments.range(..=seq).next_back().map(|(_, s)| s.clone())
        };

        match segment {
            Some(segment) if seq <= appended => segment.get(seq).inspect_err(|e| {
                if matches!(e, Error::OutOfRange { .. }) {
                    metrics::incr(&self.stats.out_of_range);
                }
            }),
            _ => {
                metrics::incr(&self.stats.out_of_range);
                Err(Error::OutOfRange {
                    seq,
                    first: self.first_seq(),
                    last: appended,
                })
            }
        }
    }

    /// Administrative reset: discard every segment and continue appending at
    /// `seq + 1`. Both appended and acknowledged sequences become `seq`.
    pub fn set_appended_seq(&self, seq: i64) -> Result<()> {
        if seq < SEQ_EMPTY {
            return Err(Error::queue(format!("invalid appended sequence {}", seq)));
        }

        let _writer = self.write_lock.lock();
        let old: Vec<Arc<Segment>> = {
            let mut segments = self.segments.write();
            let old = std::mem::take(&mut *segments).into_values().collect();
            let begin = seq + 1;
            segments.insert(
                begin,
                Arc::new(Segment::open(&self.segment_dir, begin, &self.config, 0)?),
            );
            old
        };
        for segment in old {
            if segment.begin_seq() == seq + 1 {
                // Same files were just reopened as the new empty segment.
                continue;
            }
            if let Err(e) = segment.remove() {
                tracing::warn!(begin = segment.begin_seq(), "failed to remove segment: {}", e);
            }
        }

        self.appended_seq.store(seq, Ordering::Release);
        self.acknowledged_seq.store(seq, Ordering::Release);
        self.persist_meta();
        self.notify.notify_waiters();

        tracing::info!(dir = %self.dir.display(), seq, "reset queue appended sequence");
        Ok(())
    }

    /// Advance the acknowledged sequence and schedule removal of retired
    /// segments. Values at or below the current floor, or beyond the last
    /// appended message, are ignored.
    pub fn set_acknowledged_seq(&self, seq: i64) {
        let appended = self.appended_seq();
        let seq = seq.min(appended);
        let prev = self.acknowledged_seq.fetch_max(seq, Ordering::AcqRel);
        if seq <= prev {
            return;
        }

        self.persist_meta();
        if let Some(cleaner) = self.cleaner.lock().as_ref() {
            cleaner.request(seq);
        }
    }

    fn persist_meta(&self) {
        let meta = self.meta.lock();
        if let Err(e) = meta.store(self.appended_seq(), self.acknowledged_seq()) {
            metrics::incr(&self.stats.metadata_failures);
            tracing::error!(dir = %self.dir.display(), "failed to persist queue meta: {}", e);
        }
    }

    /// Wake-up source for consumers waiting on new data
    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush meta and every segment
    pub fn sync(&self) -> Result<()> {
        self.meta.lock().sync()?;
        let segments: Vec<Arc<Segment>> = self.segments.read().values().cloned().collect();
        for segment in segments {
            segment.sync()?;
        }
        Ok(())
    }

    /// Stop the cleaner, flush and reject further writes. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut cleaner) = self.cleaner.lock().take() {
            cleaner.shutdown();
        }
        self.notify.notify_waiters();
        self.sync()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some(mut cleaner) = self.cleaner.lock().take() {
            cleaner.shutdown();
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("dir", &self.dir)
            .field("appended_seq", &self.appended_seq())
            .field("acknowledged_seq", &self.acknowledged_seq())
            .finish()
    }
}
