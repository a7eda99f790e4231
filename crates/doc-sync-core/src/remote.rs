//! Remote store abstraction: the contract a synced document needs from its transport.
//!
//! Implementations:
//! - `InMemoryConnection` - For testing and embedding
//! - `NativeConnection` (in doc-sync-daemon) - Uses tokio::fs and notify watchers
//!
//! How bytes travel to and from the store is up to the implementation. The
//! document only relies on `read`, `write` and the event subscription.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, mpsc};

use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Remote operation timed out: {0}")]
    Timeout(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Remote I/O error: {0}")]
    Failure(String),
}

impl RemoteError {
    /// Timeouts are expected on unstable links and are reported at lower severity.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Notification from a remote file subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// The file contents changed on the remote store.
    Changed,
    /// The file was deleted from the remote store.
    Deleted,
    /// The watcher backing the subscription failed.
    WatchError(String),
}

/// Stream of remote notifications for one file.
pub type RemoteEvents = mpsc::UnboundedReceiver<RemoteEvent>;

/// Read/write access to one remote file.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Path of the file on the remote store.
    fn path(&self) -> &str;

    /// Read the whole file.
    async fn read(&self) -> Result<Vec<u8>>;

    /// Replace the whole file.
    async fn write(&self, content: &[u8]) -> Result<()>;

    /// Subscribe to change, delete and watch-error notifications.
    ///
    /// Each real event is delivered at most once per subscription. No ordering
    /// is guaranteed between a `write` completing and the `Changed` it causes.
    fn subscribe(&self) -> RemoteEvents;
}

/// A connection to one remote store.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Handle for the file at `path`. The file does not need to exist.
    fn open_file(&self, path: &str) -> Arc<dyn RemoteFile>;

    /// Check if `path` exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Check if `path` is a directory.
    async fn is_directory(&self, path: &str) -> Result<bool>;
}

/// Suspends one remote operation until released.
///
/// Used to force interleavings such as "a save completes while a read is
/// outstanding".
pub struct Gate {
    entered: Notify,
    released: Semaphore,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            released: Semaphore::new(0),
        }
    }

    /// Wait until the gated operation has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated operation continue.
    pub fn release(&self) {
        self.released.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.released.acquire().await {
            permit.forget();
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct MemoryStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<RemoteEvent>>>>,
    read_failures: Mutex<HashMap<String, RemoteError>>,
    write_failures: Mutex<HashMap<String, RemoteError>>,
    read_gates: Mutex<HashMap<String, Arc<Gate>>>,
    write_gates: Mutex<HashMap<String, Arc<Gate>>>,
    exists_calls: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    echo_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
    fn add_dir_with_parents(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        let mut current = Some(paths::normalize(path));
        while let Some(dir) = current {
            current = paths::parent(&dir);
            dirs.insert(dir);
        }
    }

    fn store(&self, path: &str, content: &[u8]) {
        if let Some(parent) = paths::parent(path) {
            self.add_dir_with_parents(&parent);
        }
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), content.to_vec());
    }

    fn notify(&self, path: &str, event: RemoteEvent) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(path) {
            // Drop subscriptions whose receiver is gone.
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// In-memory remote store for testing.
///
/// Paths are POSIX-style and normalized. Writing a file creates its parent
/// directories. External mutations (`set_remote_contents`, `remove_remote`)
/// notify subscribers the way a remote watcher would.
#[derive(Clone)]
pub struct InMemoryConnection {
    store: Arc<MemoryStore>,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        let store = MemoryStore::default();
        store.add_dir_with_parents("/");
        Self {
            store: Arc::new(store),
        }
    }

    /// Create a directory (and its parents) without notifying anyone.
    pub fn add_dir(&self, path: &str) {
        self.store.add_dir_with_parents(path);
    }

    /// Create or replace a file without notifying anyone.
    pub fn add_file(&self, path: &str, content: &str) {
        self.store.store(&paths::normalize(path), content.as_bytes());
    }

    /// Simulate an external edit: replace the file and notify subscribers.
    pub fn set_remote_contents(&self, path: &str, content: &str) {
        let path = paths::normalize(path);
        self.store.store(&path, content.as_bytes());
        self.store.notify(&path, RemoteEvent::Changed);
    }

    /// Simulate an external delete: remove the file and notify subscribers.
    pub fn remove_remote(&self, path: &str) {
        let path = paths::normalize(path);
        self.store
            .files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);
        self.store.notify(&path, RemoteEvent::Deleted);
    }

    /// Simulate a watcher failure for `path`.
    pub fn emit_watch_error(&self, path: &str, message: &str) {
        self.store.notify(
            &paths::normalize(path),
            RemoteEvent::WatchError(message.to_string()),
        );
    }

    /// Current contents of a file, if it exists.
    pub fn contents(&self, path: &str) -> Option<String> {
        self.store
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&paths::normalize(path))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Fail the next read of `path` with `error`.
    pub fn fail_next_read(&self, path: &str, error: RemoteError) {
        lock(&self.store.read_failures).insert(paths::normalize(path), error);
    }

    /// Fail the next write of `path` with `error`.
    pub fn fail_next_write(&self, path: &str, error: RemoteError) {
        lock(&self.store.write_failures).insert(paths::normalize(path), error);
    }

    /// Suspend the next read of `path` until the returned gate is released.
    pub fn gate_next_read(&self, path: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        lock(&self.store.read_gates).insert(paths::normalize(path), Arc::clone(&gate));
        gate
    }

    /// Suspend the next write of `path` until the returned gate is released.
    pub fn gate_next_write(&self, path: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        lock(&self.store.write_gates).insert(paths::normalize(path), Arc::clone(&gate));
        gate
    }

    /// Make successful writes notify subscribers with `Changed`, like a real watcher.
    pub fn set_echo_writes(&self, echo: bool) {
        self.store.echo_writes.store(echo, Ordering::SeqCst);
    }

    /// Number of `exists` calls served so far.
    pub fn exists_calls(&self) -> usize {
        self.store.exists_calls.load(Ordering::SeqCst)
    }

    /// Number of file reads served so far.
    pub fn read_calls(&self) -> usize {
        self.store.reads.load(Ordering::SeqCst)
    }

    /// Number of file writes attempted so far.
    pub fn write_calls(&self) -> usize {
        self.store.writes.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn open_file(&self, path: &str) -> Arc<dyn RemoteFile> {
        Arc::new(InMemoryFile {
            path: paths::normalize(path),
            store: Arc::clone(&self.store),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.store.exists_calls.fetch_add(1, Ordering::SeqCst);
        let path = paths::normalize(path);
        let in_files = self
            .store
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&path);
        let in_dirs = self
            .store
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path);
        Ok(in_files || in_dirs)
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        let path = paths::normalize(path);
        if self
            .store
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Ok(true);
        }
        if self
            .store
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&path)
        {
            return Ok(false);
        }
        Err(RemoteError::NotFound(path))
    }
}

/// One file inside an `InMemoryConnection`.
pub struct InMemoryFile {
    path: String,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl RemoteFile for InMemoryFile {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&self) -> Result<Vec<u8>> {
        self.store.reads.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.store.read_gates).remove(&self.path);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(error) = lock(&self.store.read_failures).remove(&self.path) {
            return Err(error);
        }
        self.store
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(self.path.clone()))
    }

    async fn write(&self, content: &[u8]) -> Result<()> {
        self.store.writes.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.store.write_gates).remove(&self.path);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(error) = lock(&self.store.write_failures).remove(&self.path) {
            return Err(error);
        }
        self.store.store(&self.path, content);
        if self.store.echo_writes.load(Ordering::SeqCst) {
            self.store.notify(&self.path, RemoteEvent::Changed);
        }
        Ok(())
    }

    fn subscribe(&self) -> RemoteEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.store.subscribers)
            .entry(self.path.clone())
            .or_default()
            .push(tx);
        rx
    }
}
