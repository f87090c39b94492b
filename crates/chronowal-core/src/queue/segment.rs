//! Queue segments
//!
//! A segment covers a contiguous range of sequences starting at `begin_seq`.
//! It owns one index page and one data page:
//!
//! ```text
//! <begin>.idx   [offset:8][length:4][crc32:4] * index_page_capacity
//! <begin>.dat   raw message bytes, appended back to back
//! ```
//!
//! Segments are shared through `Arc`, so a reader that looked a segment up
//! before it was retired keeps a valid mapping until it drops its handle.

use crate::config::{INDEX_RECORD_SIZE, QueueConfig};
use crate::queue::page::MappedPage;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

const INDEX_EXT: &str = "idx";
const DATA_EXT: &str = "dat";

#[derive(Debug, Clone, Copy)]
struct SegmentTail {
    count: usize,
    data_offset: usize,
}

/// One index page + data page pair
#[derive(Debug)]
pub struct Segment {
    begin_seq: i64,
    capacity: usize,
    index: MappedPage,
    data: MappedPage,
    tail: Mutex<SegmentTail>,
}

impl Segment {
    /// Create or open the segment beginning at `begin_seq` holding `count`
    /// messages. The data tail is recovered from the last index record.
    pub fn open(dir: &Path, begin_seq: i64, config: &QueueConfig, count: usize) -> Result<Self> {
        let (index, _) = MappedPage::open(index_path(dir, begin_seq), config.index_page_size())?;
        let (data, _) = MappedPage::open(data_path(dir, begin_seq), config.data_page_size)?;

        let count = count.min(config.index_page_capacity);
        let data_offset = if count == 0 {
            0
        } else {
            let record = (count - 1) * INDEX_RECORD_SIZE;
            let offset = index.read_u64(record)? as usize;
            let len = index.read_u32(record + 8)? as usize;
            offset + len
        };

        if data_offset > data.size() {
            return Err(Error::page(format!(
                "segment {} index points past its data page",
                begin_seq
            )));
        }

        Ok(Self {
            begin_seq,
            capacity: config.index_page_capacity,
            index,
            data,
            tail: Mutex::new(SegmentTail { count, data_offset }),
        })
    }

    /// First sequence of this segment
    pub fn begin_seq(&self) -> i64 {
        self.begin_seq
    }

    /// Last written sequence (`begin_seq - 1` when empty)
    pub fn end_seq(&self) -> i64 {
        self.begin_seq + self.tail.lock().count as i64 - 1
    }

    /// Number of messages written
    pub fn count(&self) -> usize {
        self.tail.lock().count
    }

    /// Whether a message of `len` bytes still fits
    pub fn fits(&self, len: usize) -> bool {
        let tail = self.tail.lock();
        tail.count < self.capacity && tail.data_offset + len <= self.data.size()
    }

    /// Append a message, returning its sequence
    pub fn append(&self, message: &[u8]) -> Result<i64> {
        let mut tail = self.tail.lock();
        if tail.count >= self.capacity || tail.data_offset + message.len() > self.data.size() {
            return Err(Error::queue(format!("segment {} is full", self.begin_seq)));
        }

        let record = tail.count * INDEX_RECORD_SIZE;
        self.data.write_bytes(tail.data_offset, message)?;
        self.index.write_u64(record, tail.data_offset as u64)?;
        self.index.write_u32(record + 8, message.len() as u32)?;
        self.index.write_u32(record + 12, crc32fast::hash(message))?;

        let seq = self.begin_seq + tail.count as i64;
        tail.count += 1;
        tail.data_offset += message.len();
        Ok(seq)
    }

    /// Read the message at `seq`
    pub fn get(&self, seq: i64) -> Result<Vec<u8>> {
        let count = self.tail.lock().count;
        if seq < self.begin_seq || seq >= self.begin_seq + count as i64 {
            return Err(Error::OutOfRange {
                seq,
                first: self.begin_seq,
                last: self.begin_seq + count as i64 - 1,
            });
        }

        let record = (seq - self.begin_seq) as usize * INDEX_RECORD_SIZE;
        let offset = self.index.read_u64(record)? as usize;
        let len = self.index.read_u32(record + 8)? as usize;
        let crc = self.index.read_u32(record + 12)?;

        let message = self.data.read_bytes(offset, len)?;
        if crc32fast::hash(&message) != crc {
            return Err(Error::page(format!(
                "checksum mismatch for sequence {} in segment {}",
                seq, self.begin_seq
            )));
        }
        Ok(message)
    }

    /// Flush both pages
    pub fn sync(&self) -> Result<()> {
        self.index.sync()?;
        self.data.sync()
    }

    /// Delete the backing files
    pub fn remove(&self) -> Result<()> {
        self.index.remove()?;
        self.data.remove()
    }
}

fn index_path(dir: &Path, begin_seq: i64) -> PathBuf {
    dir.join(format!("{:020}.{}", begin_seq, INDEX_EXT))
}

fn data_path(dir: &Path, begin_seq: i64) -> PathBuf {
    dir.join(format!("{:020}.{}", begin_seq, DATA_EXT))
}

/// Begin sequences of all segments in `dir`, ascending
pub fn list_segments(dir: &Path) -> Result<Vec<i64>> {
    let mut begins = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(INDEX_EXT) {
            continue;
        }
        if let Some(begin) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            begins.push(begin);
        }
    }
    begins.sort_unstable();
    Ok(begins)
}
