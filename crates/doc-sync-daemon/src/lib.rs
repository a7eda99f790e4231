//! doc-sync-daemon library: native collaborators for doc-sync-core.
//!
//! This is a thin library layer under the `doc-sync` binary, allowing
//! integration tests to access the native connection and watcher.

pub mod native;
pub mod watcher;

// Re-export key types for convenience
pub use native::{DEFAULT_TIMEOUT, NativeConnection, NativeRemoteFile};
pub use watcher::FileWatcher;
