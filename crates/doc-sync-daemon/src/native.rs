//! Native remote store over the local filesystem, using tokio::fs.
//!
//! Every operation runs under a deadline so a hung mount surfaces as
//! `RemoteError::Timeout` instead of blocking the document forever.

use async_trait::async_trait;
use doc_sync_core::remote::{Connection, RemoteError, RemoteEvent, RemoteEvents, RemoteFile, Result};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::warn;

use crate::watcher::FileWatcher;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection to a directory tree on the local machine.
///
/// Remote paths are POSIX-style and resolved under `root`.
#[derive(Debug, Clone)]
pub struct NativeConnection {
    root: PathBuf,
    timeout: Duration,
}

impl NativeConnection {
    pub fn new(root: PathBuf, timeout: Duration) -> Self {
        Self { root, timeout }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn full_path(&self, path: &str) -> PathBuf {
        full_path(&self.root, path)
    }
}

impl Default for NativeConnection {
    fn default() -> Self {
        Self::new(PathBuf::from("/"), DEFAULT_TIMEOUT)
    }
}

fn full_path(root: &Path, path: &str) -> PathBuf {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn map_io(path: &str, e: io::Error) -> RemoteError {
    match e.kind() {
        io::ErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
        _ => RemoteError::Failure(format!("{}: {}", path, e)),
    }
}

/// Run `op`, failing with `Timeout` once `timeout` elapses.
async fn deadline<T>(
    path: &str,
    timeout: Duration,
    op: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result.map_err(|e| map_io(path, e)),
        Err(_) => Err(RemoteError::Timeout(format!(
            "{} (no response after {:?})",
            path, timeout
        ))),
    }
}

#[async_trait]
impl Connection for NativeConnection {
    fn open_file(&self, path: &str) -> Arc<dyn RemoteFile> {
        Arc::new(NativeRemoteFile {
            path: path.to_string(),
            local: self.full_path(path),
            timeout: self.timeout,
            watchers: Mutex::new(Vec::new()),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        deadline(path, self.timeout, fs::try_exists(self.full_path(path))).await
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        let metadata = deadline(path, self.timeout, fs::metadata(self.full_path(path))).await?;
        Ok(metadata.is_dir())
    }
}

/// One file on a `NativeConnection`.
///
/// Watchers started by `subscribe` live as long as this handle.
pub struct NativeRemoteFile {
    path: String,
    local: PathBuf,
    timeout: Duration,
    watchers: Mutex<Vec<FileWatcher>>,
}

impl NativeRemoteFile {
    pub fn local_path(&self) -> &Path {
        &self.local
    }
}

#[async_trait]
impl RemoteFile for NativeRemoteFile {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&self) -> Result<Vec<u8>> {
        deadline(&self.path, self.timeout, fs::read(&self.local)).await
    }

    async fn write(&self, content: &[u8]) -> Result<()> {
        deadline(&self.path, self.timeout, async {
            // Create parent directories if needed
            if let Some(parent) = self.local.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&self.local, content).await
        })
        .await
    }

    fn subscribe(&self) -> RemoteEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        match FileWatcher::new(&self.local, tx.clone()) {
            Ok(watcher) => self
                .watchers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(watcher),
            Err(e) => {
                warn!("Could not watch {}: {:#}", self.local.display(), e);
                let _ = tx.send(RemoteEvent::WatchError(format!("{:#}", e)));
            }
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path_resolves_under_root() {
        let root = Path::new("/srv/data");
        assert_eq!(full_path(root, "/a/b.txt"), PathBuf::from("/srv/data/a/b.txt"));
        assert_eq!(full_path(root, "/"), PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_io_errors_map_to_remote_errors() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(map_io("/x", missing), RemoteError::NotFound("/x".into()));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(map_io("/x", denied), RemoteError::Failure(m) if m.contains("/x")));
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let result: Result<()> = deadline(
            "/slow",
            Duration::from_millis(10),
            std::future::pending::<io::Result<()>>(),
        )
        .await;

        assert!(result.unwrap_err().is_timeout());
    }
}
