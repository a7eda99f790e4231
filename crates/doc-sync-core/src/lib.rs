//! doc-sync-core: Keeps editable text documents in sync with files on a remote store.
//!
//! This crate provides the core functionality for:
//! - Binding a text buffer to a remote file and saving it back
//! - Reconciling remote change, delete and watch-error notifications with local edits
//! - Locating configuration roots by walking up to a marker file
//! - Connection and RemoteFile trait abstractions, with an in-memory implementation

pub mod buffer;
pub mod config_dir;
pub mod document;
pub mod encoding;
pub mod events;
pub mod paths;
mod reconcile;
pub mod registry;
pub mod remote;
pub mod save;
pub mod uri;

pub use buffer::{BufferError, DIFF_LINE_LIMIT, LoroBuffer, TextBuffer, TextChange};
pub use config_dir::ConfigDirectoryCache;
pub use document::{DocumentId, DocumentSnapshot, SyncError, SyncedDocument};
pub use encoding::{DeletePolicy, DocumentOptions, Encoding, EncodingError};
pub use events::{DocumentEvent, EventBus, Subscription};
pub use registry::ConnectionRegistry;
pub use remote::{
    Connection, Gate, InMemoryConnection, RemoteError, RemoteEvent, RemoteEvents, RemoteFile,
};
pub use save::{SaveCoordinator, SaveFailure, SaveNotifier, SaveOutcome, Severity};
pub use uri::{RemoteUri, UriError};
