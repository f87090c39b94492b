//! WAL, queue and ingestion channel configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Size index record in bytes: offset(8) + length(4) + crc32(4)
pub const INDEX_RECORD_SIZE: usize = 16;

/// Queue (segment/page) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Size of each segment's data page in bytes
    pub data_page_size: usize,

    /// Number of messages one segment's index page can address
    pub index_page_capacity: usize,

    /// Largest accepted message
    pub max_message_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            data_page_size: 64 * 1024 * 1024,
            index_page_capacity: 64 * 1024,
            max_message_size: 8 * 1024 * 1024,
        }
    }
}

impl QueueConfig {
    /// Set data page size
    pub fn with_data_page_size(mut self, size: usize) -> Self {
        self.data_page_size = size;
        self
    }

    /// Set index page capacity
    pub fn with_index_page_capacity(mut self, capacity: usize) -> Self {
        self.index_page_capacity = capacity;
        self
    }

    /// Set message size limit
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Size of an index page in bytes
    pub fn index_page_size(&self) -> usize {
        self.index_page_capacity * INDEX_RECORD_SIZE
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.index_page_capacity == 0 {
            return Err(Error::config("index_page_capacity must be at least 1"));
        }
        if self.max_message_size == 0 {
            return Err(Error::config("max_message_size must be at least 1"));
        }
        if self.max_message_size > self.data_page_size {
            return Err(Error::config(format!(
                "max_message_size {} exceeds data_page_size {}",
                self.max_message_size, self.data_page_size
            )));
        }
        if self.data_page_size > u32::MAX as usize {
            return Err(Error::config("data_page_size must fit in 32 bits"));
        }
        Ok(())
    }
}

/// Write-ahead log manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Root directory of all partitions
    pub dir: PathBuf,

    /// Queue layout
    pub queue: QueueConfig,

    /// Interval of the partition garbage collector
    pub gc_interval: Duration,

    /// How long a drained partition is kept after its family time
    pub family_ttl: Duration,

    /// Idle backoff of replicator peers
    pub replica_idle: Duration,

    /// Longest a remote replicator waits for an offline follower per attempt
    pub node_wait_timeout: Duration,

    /// Timeout of unary RPCs and stream round trips
    pub rpc_timeout: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            queue: QueueConfig::default(),
            gc_interval: Duration::from_secs(60),
            family_ttl: Duration::from_secs(24 * 3600),
            replica_idle: Duration::from_millis(100),
            node_wait_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

impl WalConfig {
    /// Create a configuration rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set queue layout
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set replicator idle backoff
    pub fn with_replica_idle(mut self, idle: Duration) -> Self {
        self.replica_idle = idle;
        self
    }

    /// Set family TTL
    pub fn with_family_ttl(mut self, ttl: Duration) -> Self {
        self.family_ttl = ttl;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.gc_interval.is_zero() {
            return Err(Error::config("gc_interval must be non-zero"));
        }
        if self.replica_idle.is_zero() {
            return Err(Error::config("replica_idle must be non-zero"));
        }
        Ok(())
    }
}

/// Ingestion channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Uncompressed chunk size that triggers a flush, in bytes
    pub batch_size: usize,

    /// Age after which a partial chunk is flushed
    pub batch_timeout: Duration,

    /// Compressed batches kept for redelivery before the oldest is dropped
    pub max_retry_buffer: usize,

    /// Capacity of the chunk hand-off channel
    pub channel_buffer: usize,

    /// Width of one family time bucket
    pub family_interval: Duration,

    /// How far into the future rows are accepted
    pub ahead: Duration,

    /// How far into the past rows are accepted
    pub behind: Duration,

    /// Interval of the family channel garbage collector
    pub gc_interval: Duration,

    /// How long `stop` waits for a family write task
    pub stop_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            batch_size: 256 * 1024,
            batch_timeout: Duration::from_millis(500),
            max_retry_buffer: 100,
            channel_buffer: 32,
            family_interval: Duration::from_secs(3600),
            ahead: Duration::from_secs(3600),
            behind: Duration::from_secs(3600),
            gc_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set batch timeout
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Set retry buffer size
    pub fn with_max_retry_buffer(mut self, size: usize) -> Self {
        self.max_retry_buffer = size;
        self
    }

    /// Set acceptance window
    pub fn with_window(mut self, behind: Duration, ahead: Duration) -> Self {
        self.behind = behind;
        self.ahead = ahead;
        self
    }

    /// Family interval in milliseconds
    pub fn family_interval_ms(&self) -> i64 {
        self.family_interval.as_millis() as i64
    }

    /// Whether `timestamp` lies inside `[now - behind, now + ahead]`
    pub fn accepts(&self, timestamp: i64, now: i64) -> bool {
        let behind = self.behind.as_millis() as i64;
        let ahead = self.ahead.as_millis() as i64;
        timestamp >= now - behind && timestamp <= now + ahead
    }

    /// Whether a family bucket can still receive rows at `now`
    pub fn family_alive(&self, family_time: i64, now: i64) -> bool {
        let interval = self.family_interval_ms();
        let behind = self.behind.as_millis() as i64;
        let ahead = self.ahead.as_millis() as i64;
        family_time + interval >= now - behind && family_time <= now + ahead
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.channel_buffer == 0 {
            return Err(Error::config("channel_buffer must be at least 1"));
        }
        if self.family_interval.is_zero() {
            return Err(Error::config("family_interval must be non-zero"));
        }
        if self.batch_timeout.is_zero() || self.gc_interval.is_zero() {
            return Err(Error::config("batch_timeout and gc_interval must be non-zero"));
        }
        Ok(())
    }
}
