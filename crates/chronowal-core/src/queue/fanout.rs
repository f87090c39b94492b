//! Fan-out queue: one [`Queue`] read by many named [`ConsumerGroup`]s
//!
//! ```text
//! <root>/
//!   queue.meta
//!   segment/
//!   consumer_group/<name>/meta
//! ```
//!
//! The group registry is copy-on-write: lookups load an immutable snapshot
//! without locking, insertions and removals rebuild the map under a mutation
//! lock and publish it atomically.

use crate::config::QueueConfig;
use crate::metrics::QueueStats;
use crate::queue::{ConsumerGroup, Queue};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const CONSUMER_GROUP_DIR: &str = "consumer_group";

type GroupMap = HashMap<String, Arc<ConsumerGroup>>;

/// Queue with independent consumer groups
pub struct FanOutQueue {
    dir: PathBuf,
    queue: Arc<Queue>,
    groups: ArcSwap<GroupMap>,
    mutation_lock: Mutex<()>,
    stats: Arc<QueueStats>,
    closed: AtomicBool,
}

impl FanOutQueue {
    /// Open or create a fan-out queue rooted at `dir`, recovering every
    /// consumer group found on disk.
    pub fn open<P: AsRef<Path>>(dir: P, config: QueueConfig, stats: Arc<QueueStats>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let queue = Arc::new(Queue::open(&dir, config, stats.clone())?);

        let group_root = dir.join(CONSUMER_GROUP_DIR);
        std::fs::create_dir_all(&group_root)?;

        let mut groups = GroupMap::new();
        for entry in std::fs::read_dir(&group_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let group = ConsumerGroup::open(entry.path(), name.clone(), queue.clone(), stats.clone())?;
            groups.insert(name, Arc::new(group));
        }

        tracing::debug!(
            dir = %dir.display(),
            groups = groups.len(),
            "opened fan-out queue"
        );

        Ok(Self {
            dir,
            queue,
            groups: ArcSwap::from_pointee(groups),
            mutation_lock: Mutex::new(()),
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Underlying queue
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Statistics handle
    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    /// Append a message
    pub fn put(&self, data: &[u8]) -> Result<i64> {
        self.queue.put(data)
    }

    /// Look up an existing group
    pub fn get_consumer_group(&self, name: &str) -> Option<Arc<ConsumerGroup>> {
        self.groups.load().get(name).cloned()
    }

    /// Get the group called `name`, creating it on first access
    pub fn get_or_create_consumer_group(&self, name: &str) -> Result<Arc<ConsumerGroup>> {
        if let Some(group) = self.get_consumer_group(name) {
            return Ok(group);
        }
        validate_group_name(name)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(format!("fan-out queue {}", self.dir.display())));
        }

        let _guard = self.mutation_lock.lock();
        let current = self.groups.load_full();
        if let Some(group) = current.get(name) {
            return Ok(group.clone());
        }

        let group = Arc::new(ConsumerGroup::open(
            self.dir.join(CONSUMER_GROUP_DIR).join(name),
            name,
            self.queue.clone(),
            self.stats.clone(),
        )?);

        let mut next = GroupMap::clone(&current);
        next.insert(name.to_string(), group.clone());
        self.groups.store(Arc::new(next));

        tracing::info!(dir = %self.dir.display(), group = name, "created consumer group");
        Ok(group)
    }

    /// Names of all groups, sorted
    pub fn consumer_group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// All groups
    pub fn consumer_groups(&self) -> Vec<Arc<ConsumerGroup>> {
        self.groups.load().values().cloned().collect()
    }

    /// Remove a group and delete its metadata. Returns whether it existed.
    pub fn remove_consumer_group(&self, name: &str) -> Result<bool> {
        let removed = {
            let _guard = self.mutation_lock.lock();
            let current = self.groups.load_full();
            if !current.contains_key(name) {
                return Ok(false);
            }
            let mut next = GroupMap::clone(&current);
            let removed = next.remove(name);
            self.groups.store(Arc::new(next));
            removed
        };

        if let Some(group) = removed {
            group.close()?;
            std::fs::remove_dir_all(group.dir())?;
            tracing::info!(dir = %self.dir.display(), group = name, "removed consumer group");
        }
        Ok(true)
    }

    /// Lowest acknowledged sequence across all groups; the appended sequence
    /// when there are no groups.
    pub fn min_acknowledged_seq(&self) -> i64 {
        self.groups
            .load()
            .values()
            .map(|g| g.acknowledged_seq())
            .min()
            .unwrap_or_else(|| self.queue.appended_seq())
    }

    /// Raise the queue's acknowledged floor to the slowest group's ack,
    /// letting fully acknowledged segments be removed.
    pub fn sync(&self) {
        let floor = self.min_acknowledged_seq();
        if floor > self.queue.acknowledged_seq() {
            tracing::debug!(dir = %self.dir.display(), floor, "advancing queue acknowledged floor");
            self.queue.set_acknowledged_seq(floor);
        }
    }

    /// Administrative reset of the queue; every group's consumed and
    /// acknowledged sequences follow to `seq`.
    pub fn set_appended_seq(&self, seq: i64) -> Result<()> {
        let _guard = self.mutation_lock.lock();
        self.queue.set_appended_seq(seq)?;
        for group in self.groups.load().values() {
            group.reset(seq);
        }
        Ok(())
    }

    /// Whether every group acknowledged everything appended
    pub fn is_empty(&self) -> bool {
        self.groups.load().values().all(|g| g.is_empty())
    }

    /// Flush queue and group metadata to stable storage
    pub fn flush(&self) -> Result<()> {
        self.queue.sync()?;
        for group in self.groups.load().values() {
            group.sync()?;
        }
        Ok(())
    }

    /// Close all groups and the queue. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for group in self.groups.load().values() {
            if let Err(e) = group.close() {
                tracing::warn!(group = group.name(), "failed to close consumer group: {}", e);
            }
        }
        self.queue.close()
    }
}

impl std::fmt::Debug for FanOutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutQueue")
            .field("dir", &self.dir)
            .field("groups", &self.consumer_group_names())
            .finish()
    }
}

fn validate_group_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        return Err(Error::consumer_group(format!("invalid group name {:?}", name)));
    }
    Ok(())
}
