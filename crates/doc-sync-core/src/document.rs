//! SyncedDocument: an editable text buffer bound to a file on a remote store.
//!
//! The document owns the authoritative sync state (cached disk contents, save
//! generation, pending save snapshot, conflict flag) behind one lock, so a save
//! completing and a reconciliation reading that state always see a consistent
//! triple.
//!
//! Remote notifications are handled by a per-document queue task: it owns the
//! subscription receiver and processes one notification at a time, including
//! the read it suspends on. A second change or delete never starts before the
//! previous one finished. Saves do not go through the queue; they update the
//! state under the lock at start and on completion.

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{BufferError, LoroBuffer, TextBuffer, TextChange};
use crate::encoding::{DocumentOptions, EncodingError};
use crate::events::{DocumentEvent, EventBus, Subscription};
use crate::paths;
use crate::remote::{Connection, RemoteError, RemoteEvent, RemoteEvents, RemoteFile};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Document has no remote connection")]
    Unbound,

    #[error("No connection registered for host: {0}")]
    UnknownHost(String),

    #[error("Document queue closed")]
    Closed,
}

impl SyncError {
    /// True when the underlying remote operation exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Stable identity of a document across path changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(Uuid);

impl DocumentId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Point-in-time copy of a document's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub path: Option<String>,
    pub text: String,
    pub cached_disk_contents: Option<String>,
    pub exists: bool,
    pub save_generation: u64,
    pub pending_save_content: Option<String>,
    pub conflict: bool,
    pub was_modified_before_remove: bool,
    pub destroyed: bool,
    pub modified: bool,
}

pub(crate) struct DocState {
    pub(crate) buffer: Box<dyn TextBuffer>,
    pub(crate) path: Option<String>,
    pub(crate) remote: Option<Arc<dyn RemoteFile>>,
    /// Bumped whenever `remote` is replaced or cleared.
    pub(crate) binding_epoch: u64,
    pub(crate) cached_disk_contents: Option<String>,
    pub(crate) exists: bool,
    pub(crate) save_generation: u64,
    pub(crate) pending_save_content: Option<String>,
    pub(crate) conflict: bool,
    pub(crate) was_modified_before_remove: bool,
    pub(crate) destroyed: bool,
    /// Last modified status announced to observers.
    reported_modified: bool,
}

impl DocState {
    /// Text differs from the last known disk contents (absent counts as empty).
    pub(crate) fn is_modified(&self) -> bool {
        self.buffer.text() != self.cached_disk_contents.as_deref().unwrap_or("")
    }

    /// Event to emit if the modified status flipped since it was last reported.
    pub(crate) fn modified_status_event(&mut self) -> Option<DocumentEvent> {
        let modified = self.is_modified();
        if modified == self.reported_modified {
            return None;
        }
        self.reported_modified = modified;
        Some(DocumentEvent::ModifiedStatusChanged { modified })
    }
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Job {
    Remote(RemoteEvent, Option<Reply<()>>),
    Reload(Reply<()>),
    Rebind(Option<RemoteEvents>),
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Inner {
    pub(crate) id: DocumentId,
    pub(crate) options: DocumentOptions,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    state: Mutex<DocState>,
    events: Arc<EventBus<DocumentEvent>>,
    text_changes: Arc<Mutex<Vec<TextChange>>>,
    _buffer_subscription: Subscription,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Inner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit buffered text changes followed by `events`. Never call with the state lock held.
    pub(crate) fn emit_all(&self, events: impl IntoIterator<Item = DocumentEvent>) {
        let changes: Vec<TextChange> = std::mem::take(
            &mut *self.text_changes.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for change in changes {
            self.events.emit(DocumentEvent::DidChangeText {
                full_replace: change.full_replace,
            });
        }
        for event in events {
            self.events.emit(event);
        }
    }

    pub(crate) fn send(&self, job: Job) -> Result<()> {
        self.jobs.send(job).map_err(|_| SyncError::Closed)
    }

    /// Fail unless the document can be bound to a path.
    pub(crate) fn check_bindable(&self) -> Result<&Arc<dyn Connection>> {
        let connection = self.connection.as_ref().ok_or(SyncError::Unbound)?;
        if self.lock_state().destroyed {
            return Err(SyncError::Closed);
        }
        Ok(connection)
    }

    /// Bind to `path` on this document's connection and re-subscribe.
    ///
    /// A reconciliation still reading the previous binding discards its result.
    pub(crate) fn set_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(SyncError::InvalidArgument("path is empty".into()));
        }
        let connection = self.check_bindable()?;
        let path = paths::normalize(path);

        let already_bound = {
            let state = self.lock_state();
            if state.destroyed {
                return Err(SyncError::Closed);
            }
            state.path.as_deref() == Some(path.as_str()) && state.remote.is_some()
        };
        if already_bound {
            return Ok(());
        }

        let remote = connection.open_file(&path);
        let events = remote.subscribe();
        {
            let mut state = self.lock_state();
            state.path = Some(path.clone());
            state.remote = Some(remote);
            state.binding_epoch += 1;
        }
        self.send(Job::Rebind(Some(events)))?;
        debug!("Document {} bound to {}", self.id, path);
        self.emit_all([DocumentEvent::DidChangePath { path }]);
        Ok(())
    }

    pub(crate) fn destroy(&self) {
        let was_destroyed = {
            let mut state = self.lock_state();
            let was = state.destroyed;
            state.destroyed = true;
            state.remote = None;
            state.binding_epoch += 1;
            was
        };
        if was_destroyed {
            return;
        }
        // The queue may already be gone when the document is being dropped.
        let _ = self.send(Job::Rebind(None));
        info!("Destroyed document {}", self.id);
        self.emit_all([DocumentEvent::DidDestroy]);
    }
}

/// An in-memory document bound to a remote file.
///
/// Cloning yields another handle to the same document.
#[derive(Clone)]
pub struct SyncedDocument {
    pub(crate) inner: Arc<Inner>,
}

impl SyncedDocument {
    /// Open the document at `path` on `connection`, loading its contents.
    ///
    /// A missing file yields an empty document that does not exist yet.
    /// Must be called inside a tokio runtime.
    pub async fn open(
        connection: Arc<dyn Connection>,
        path: &str,
        options: DocumentOptions,
    ) -> Result<Self> {
        if path.is_empty() {
            return Err(SyncError::InvalidArgument("path is empty".into()));
        }
        let path = paths::normalize(path);
        let remote = connection.open_file(&path);

        let disk = match remote.read().await {
            Ok(bytes) => Some(options.encoding.decode(&bytes)?),
            Err(RemoteError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let text = disk.clone().unwrap_or_default();
        let document = Self::build(Some(connection), options, &text)?;
        let events = remote.subscribe();
        {
            let mut state = document.inner.lock_state();
            state.exists = disk.is_some();
            state.cached_disk_contents = disk;
            state.path = Some(path.clone());
            state.remote = Some(remote);
        }
        document.inner.send(Job::Rebind(Some(events)))?;

        info!("Opened document {} at {}", document.inner.id, path);
        Ok(document)
    }

    /// Create a document with no remote binding, holding `text`.
    ///
    /// With a connection, the document can later be saved somewhere.
    /// Must be called inside a tokio runtime.
    pub fn untitled(
        connection: Option<Arc<dyn Connection>>,
        text: &str,
        options: DocumentOptions,
    ) -> Result<Self> {
        let document = Self::build(connection, options, text)?;
        let event = document.inner.lock_state().modified_status_event();
        document.inner.emit_all(event);
        debug!("Created untitled document {}", document.inner.id);
        Ok(document)
    }

    fn build(
        connection: Option<Arc<dyn Connection>>,
        options: DocumentOptions,
        text: &str,
    ) -> Result<Self> {
        let buffer = LoroBuffer::with_text(text)?;

        let text_changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&text_changes);
        let buffer_subscription = buffer.subscribe(Box::new(move |change| {
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(change);
        }));

        let state = DocState {
            buffer: Box::new(buffer),
            path: None,
            remote: None,
            binding_epoch: 0,
            cached_disk_contents: None,
            exists: false,
            save_generation: 0,
            pending_save_content: None,
            conflict: false,
            was_modified_before_remove: false,
            destroyed: false,
            reported_modified: false,
        };

        let (jobs, job_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            id: DocumentId::generate(),
            options,
            connection,
            state: Mutex::new(state),
            events: Arc::new(EventBus::new()),
            text_changes,
            _buffer_subscription: buffer_subscription,
            jobs,
        });
        tokio::spawn(run_queue(Arc::downgrade(&inner), job_rx));

        Ok(Self { inner })
    }

    pub fn id(&self) -> DocumentId {
        self.inner.id
    }

    pub fn options(&self) -> &DocumentOptions {
        &self.inner.options
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.connection.clone()
    }

    pub fn path(&self) -> Option<String> {
        self.inner.lock_state().path.clone()
    }

    pub fn text(&self) -> String {
        self.inner.lock_state().buffer.text()
    }

    pub fn line_count(&self) -> usize {
        self.inner.lock_state().buffer.line_count()
    }

    pub fn cached_disk_contents(&self) -> Option<String> {
        self.inner.lock_state().cached_disk_contents.clone()
    }

    pub fn exists(&self) -> bool {
        self.inner.lock_state().exists
    }

    pub fn save_generation(&self) -> u64 {
        self.inner.lock_state().save_generation
    }

    pub fn pending_save_content(&self) -> Option<String> {
        self.inner.lock_state().pending_save_content.clone()
    }

    pub fn is_in_conflict(&self) -> bool {
        self.inner.lock_state().conflict
    }

    pub fn was_modified_before_remove(&self) -> bool {
        self.inner.lock_state().was_modified_before_remove
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock_state().destroyed
    }

    pub fn is_modified(&self) -> bool {
        self.inner.lock_state().is_modified()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        let state = self.inner.lock_state();
        DocumentSnapshot {
            path: state.path.clone(),
            text: state.buffer.text(),
            cached_disk_contents: state.cached_disk_contents.clone(),
            exists: state.exists,
            save_generation: state.save_generation,
            pending_save_content: state.pending_save_content.clone(),
            conflict: state.conflict,
            was_modified_before_remove: state.was_modified_before_remove,
            destroyed: state.destroyed,
            modified: state.is_modified(),
        }
    }

    /// Subscribe to document events. Drop the handle to unsubscribe.
    pub fn subscribe(&self, callback: impl Fn(DocumentEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    /// Replace the whole text.
    pub fn set_text(&self, text: &str) -> Result<()> {
        let event = {
            let mut state = self.inner.lock_state();
            state.buffer.set_text(text)?;
            state.modified_status_event()
        };
        self.inner.emit_all(event);
        Ok(())
    }

    /// Replace the text through a line-level diff (wholesale above the line limit).
    pub fn set_text_via_diff(&self, text: &str) -> Result<()> {
        let event = {
            let mut state = self.inner.lock_state();
            state.buffer.set_text_via_diff(text)?;
            state.modified_status_event()
        };
        self.inner.emit_all(event);
        Ok(())
    }

    /// Rebind the document to another path on the same connection.
    pub fn set_path(&self, path: &str) -> Result<()> {
        self.inner.set_path(path)
    }

    /// Reconcile a remote change now, through the document's queue.
    pub async fn reconcile_change(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(Job::Remote(RemoteEvent::Changed, Some(reply)))?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Reconcile a remote delete now, through the document's queue.
    pub async fn reconcile_delete(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(Job::Remote(RemoteEvent::Deleted, Some(reply)))?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Forward a watcher error to observers.
    pub fn notify_watch_error(&self, message: &str) -> Result<()> {
        self.inner
            .send(Job::Remote(RemoteEvent::WatchError(message.to_string()), None))
    }

    /// Discard local edits and reload the remote contents.
    pub async fn reload(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(Job::Reload(reply))?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Wait until every notification queued so far has been reconciled.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(Job::Flush(reply))?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Destroy the document: clear the remote binding and notify observers.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

async fn next_remote_event(events: &mut Option<RemoteEvents>) -> Option<RemoteEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-document queue: one job at a time, remote notifications first.
async fn run_queue(inner: Weak<Inner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let mut remote_events: Option<RemoteEvents> = None;

    loop {
        let job = tokio::select! {
            biased;
            event = next_remote_event(&mut remote_events) => match event {
                Some(event) => Job::Remote(event, None),
                None => {
                    remote_events = None;
                    continue;
                }
            },
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match job {
            Job::Rebind(events) => remote_events = events,
            Job::Flush(reply) => {
                let _ = reply.send(());
            }
            Job::Reload(reply) => {
                let _ = reply.send(inner.reload_from_remote().await);
            }
            Job::Remote(event, reply) => {
                let result = inner.handle_remote_event(event).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!("Reconciliation failed for document {}: {}", inner.id, e);
                        }
                    }
                }
            }
        }
    }

    debug!("Document queue stopped");
}
