//! Persistent fan-out queue
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ FanOutQueue                                  │
//! │   ConsumerGroup "a"   ConsumerGroup "b" ...  │
//! │          └──────────┬─────────┘              │
//! │                   Queue                      │
//! │   Segment [0..n)  Segment [n..m)  ...        │
//! │     index page + data page (mmap)            │
//! └──────────────────────────────────────────────┘
//! ```

pub mod consumer_group;
pub mod core;
pub mod fanout;
pub mod page;
pub mod segment;

pub use consumer_group::ConsumerGroup;
pub use self::core::Queue;
pub use fanout::FanOutQueue;
