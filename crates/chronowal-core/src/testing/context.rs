//! TestContext - Manages test lifecycle and resource cleanup
//!
//! Every test gets its own temporary directory, removed when the context is
//! dropped. Multi-node tests carve one subdirectory per node out of it.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Context for managing test resources and lifecycle
///
/// # Example
///
/// ```rust,ignore
/// use chronowal_core::testing::TestContext;
///
/// #[test]
/// fn my_test() {
///     let ctx = TestContext::new();
///     let leader_dir = ctx.subdir("node-1");
///     // All files are removed when ctx is dropped
/// }
/// ```
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a new TestContext with a unique temporary directory
    ///
    /// The directory is guaranteed to exist before this function returns.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Get the path to the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create (if needed) and return a subdirectory of the test directory
    pub fn subdir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create test subdirectory");
        dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
