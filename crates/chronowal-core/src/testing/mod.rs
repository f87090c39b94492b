//! Testing infrastructure for Chronowal Core
//!
//! In-memory stand-ins for the collaborators the WAL core talks to, plus
//! the temporary directory helper every test uses.
//!
//! # Key Features
//!
//! - **TestContext**: Manages test lifecycle and automatic cleanup
//! - **MemoryStorageEngine / StaticStateManager**: Scriptable collaborators
//! - **RecordingTransport**: Scripted follower answers for replicator tests
//! - **RecordingSinkFactory / LineConverter**: Ingestion channel doubles
//! - **LoopbackTransport**: Routes RPCs to in-process [`crate::wal::WalManager`]s
//!
//! # Usage
//!
//! ```rust,ignore
//! use chronowal_core::testing::{LoopbackTransport, TestContext};
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let ctx = TestContext::new();
//!     let transport = LoopbackTransport::new();
//!     // Open one WalManager per node under ctx.subdir(..), register them...
//! }
//! ```

mod context;
mod doubles;
mod transport;

pub use context::TestContext;
pub use doubles::{LineConverter, MemoryStorageEngine, RecordingSinkFactory, StaticStateManager};
pub use transport::{LoopbackTransport, RecordingTransport};

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
