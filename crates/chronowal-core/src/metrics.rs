//! Statistics handles
//!
//! Every long-lived component receives an `Arc` to one of these structs from
//! its owner instead of writing to a process-wide registry. Counters use
//! `Ordering::Relaxed`: they are monotonic statistics and never publish other
//! memory, so readers only need eventual visibility.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

macro_rules! stats {
    (
        $(#[$meta:meta])*
        $name:ident => $snapshot:ident {
            counters { $($(#[$cmeta:meta])* $counter:ident),* $(,)? }
            gauges { $($(#[$gmeta:meta])* $gauge:ident),* $(,)? }
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($(#[$cmeta])* pub $counter: AtomicU64,)*
            $($(#[$gmeta])* pub $gauge: AtomicI64,)*
        }

        /// Point-in-time copy of the counters
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $snapshot {
            $($(#[$cmeta])* pub $counter: u64,)*
            $($(#[$gmeta])* pub $gauge: i64,)*
        }

        impl $name {
            /// Read all counters
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $($counter: self.$counter.load(Ordering::Relaxed),)*
                    $($gauge: self.$gauge.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

/// Increment a counter by one
#[inline]
pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Increment a counter by `n`
#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Set a gauge
#[inline]
pub(crate) fn set(gauge: &AtomicI64, value: i64) {
    gauge.store(value, Ordering::Relaxed);
}

/// Move a gauge shared by several owners by `delta`
#[inline]
pub(crate) fn adjust(gauge: &AtomicI64, delta: i64) {
    gauge.fetch_add(delta, Ordering::Relaxed);
}

stats! {
    /// Queue / consumer group statistics
    QueueStats => QueueStatsSnapshot {
        counters {
            /// Messages appended
            puts,
            /// Bytes appended
            put_bytes,
            /// Rejected appends
            put_failures,
            /// Reads that hit a removed or unwritten sequence
            out_of_range,
            /// Segments removed after full acknowledgement
            removed_segments,
            /// Failed segment removals
            cleanup_failures,
            /// Acks outside `(acknowledged, consumed]`
            invalid_acks,
            /// Metadata page write failures
            metadata_failures,
        }
        gauges {}
    }
}

stats! {
    /// Replicator statistics, one per replication edge
    ReplicatorStats => ReplicatorStatsSnapshot {
        counters {
            /// Messages delivered
            replicated,
            /// Bytes delivered
            replicated_bytes,
            /// Successful handshakes
            handshakes,
            /// Failed handshakes
            handshake_failures,
            /// Follower index resets requested
            resets,
            /// Send failures
            send_failures,
            /// Receive failures
            receive_failures,
            /// Responses whose ack did not match the request
            invalid_acks,
            /// Local deliveries whose sequence did not match
            invalid_sequences,
            /// Messages that failed to decompress or decode
            decode_failures,
            /// Rows whose metadata lookup failed
            lookup_failures,
            /// Storage write failures
            write_failures,
            /// Messages that could not be read from the log
            read_failures,
        }
        gauges {
            /// Messages waiting for delivery
            pending,
        }
    }
}

stats! {
    /// Partition (WAL instance) statistics
    PartitionStats => PartitionStatsSnapshot {
        counters {
            /// Leader-side log writes
            write_logs,
            /// Failed leader-side writes
            write_failures,
            /// Follower-side accepted writes
            replica_logs,
            /// Follower-side writes rejected for sequence mismatch
            replica_mismatches,
            /// Follower-side failed writes
            replica_failures,
            /// Append index resets
            index_resets,
        }
        gauges {}
    }
}

stats! {
    /// Ingestion channel statistics
    ChannelStats => ChannelStatsSnapshot {
        counters {
            /// Rows accepted
            written_rows,
            /// Rows rejected by the acceptance window
            evicted_rows,
            /// Metrics that failed to convert
            conversion_failures,
            /// Compressed chunks produced
            flushed_chunks,
            /// Chunks delivered to the write path
            send_successes,
            /// Failed delivery attempts
            send_failures,
            /// Redelivery attempts
            retries,
            /// Chunks dropped because the retry buffer was full
            retry_drops,
            /// Chunks the write path refused permanently
            rejected_chunks,
            /// Chunks lost because compression failed
            compression_failures,
            /// Leader changes observed
            leader_changes,
            /// Family channels created
            created_families,
            /// Family channels garbage collected
            expired_families,
        }
        gauges {
            /// Chunks waiting for delivery
            pending_chunks,
        }
    }
}
