//! Row batches and their compressed wire form
//!
//! ```text
//! row   := [timestamp:i64 LE][series_hash:u64 LE][len:u32 LE][payload:len]
//! chunk := zstd(row*)
//! ```

use crate::types::BrokerRow;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

const ROW_HEADER_SIZE: usize = 8 + 8 + 4;
const COMPRESSION_LEVEL: i32 = 3;

/// Size-bounded buffer of encoded rows
#[derive(Debug)]
pub struct Chunk {
    buf: Vec<u8>,
    rows: usize,
    limit: usize,
}

impl Chunk {
    /// Empty chunk that reports full at `limit` uncompressed bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(1 << 20)),
            rows: 0,
            limit,
        }
    }

    /// Encode `row` into the buffer
    pub fn append(&mut self, row: &BrokerRow) {
        self.buf.reserve(row.encoded_len());
        self.buf.put_i64_le(row.timestamp);
        self.buf.put_u64_le(row.series_hash);
        self.buf.put_u32_le(row.payload.len() as u32);
        self.buf.put_slice(&row.payload);
        self.rows += 1;
    }

    /// Whether the buffer reached its limit
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Whether no row is buffered
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Buffered rows
    pub fn len(&self) -> usize {
        self.rows
    }

    /// Uncompressed size in bytes
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Compress the buffered rows and reset the buffer
    pub fn compress(&mut self) -> Result<Bytes> {
        let compressed = zstd::encode_all(self.buf.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| Error::internal(format!("compress chunk: {}", e)))?;
        self.buf.clear();
        self.rows = 0;
        Ok(Bytes::from(compressed))
    }
}

/// Decompress a chunk and decode its rows
pub fn decode_chunk(data: &[u8]) -> Result<Vec<BrokerRow>> {
    let raw = zstd::decode_all(data).map_err(|e| Error::decode(format!("decompress chunk: {}", e)))?;

    let mut buf = raw.as_slice();
    let mut rows = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < ROW_HEADER_SIZE {
            return Err(Error::decode(format!(
                "truncated row header: {} bytes left",
                buf.remaining()
            )));
        }
        let timestamp = buf.get_i64_le();
        let series_hash = buf.get_u64_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::decode(format!(
                "row payload of {} bytes exceeds remaining {}",
                len,
                buf.remaining()
            )));
        }
        let payload = buf[..len].to_vec();
        buf.advance(len);
        rows.push(BrokerRow {
            timestamp,
            series_hash,
            payload,
        });
    }
    Ok(rows)
}
