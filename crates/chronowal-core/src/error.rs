//! Error types for Chronowal Core

use thiserror::Error;

/// Result type alias using Chronowal Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the write-ahead log and replication layers
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from page and directory operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message does not fit into a data page
    #[error("message size {size} exceeds limit {limit}")]
    ExceedingMessageSizeLimit {
        /// Size of the rejected payload
        size: usize,
        /// Configured maximum message size
        limit: usize,
    },

    /// Requested sequence is not (or no longer) retained by the queue
    #[error("sequence {seq} out of range [{first}, {last}]")]
    OutOfRange {
        /// Requested sequence
        seq: i64,
        /// First retained sequence
        first: i64,
        /// Last appended sequence
        last: i64,
    },

    /// Page (memory-mapped region) errors
    #[error("Page error: {0}")]
    Page(String),

    /// Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// Consumer group errors
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Replication errors (handshake, stream, remote rejection)
    #[error("Replication error: {0}")]
    Replication(String),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Decompression / row decoding errors
    #[error("Decode error: {0}")]
    Decode(String),

    /// Storage engine errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Ingestion channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Component already closed
    #[error("Closed: {0}")]
    Closed(String),

    /// A remote node refused the request for good
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a page error
    pub fn page(msg: impl Into<String>) -> Self {
        Self::Page(msg.into())
    }

    /// Create a queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a consumer group error
    pub fn consumer_group(msg: impl Into<String>) -> Self {
        Self::ConsumerGroup(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Create a rejection error
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Connectivity failures that the peer loop or a channel retries later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Replication(_) | Self::Protocol(_) | Self::Closed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ExceedingMessageSizeLimit {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(err.to_string(), "message size 2048 exceeds limit 1024");

        let err = Error::OutOfRange {
            seq: 3,
            first: 5,
            last: 9,
        };
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::replication("stream reset").is_retryable());
        assert!(Error::closed("transport").is_retryable());
        assert!(!Error::decode("bad frame").is_retryable());
        assert!(!Error::rejected("message too large").is_retryable());
        assert!(
            !Error::ExceedingMessageSizeLimit {
                size: 1,
                limit: 0
            }
            .is_retryable()
        );
    }
}
