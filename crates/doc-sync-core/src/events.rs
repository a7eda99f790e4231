//! Event infrastructure for doc-sync-core.
//!
//! Provides `DocumentEvent` for observers of a synced document (UI, CLI) and a
//! generic `EventBus` with drop-to-unsubscribe handles. The same bus carries
//! `TextChange` notifications out of a `TextBuffer`.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a `SyncedDocument` to external listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DocumentEvent {
    /// The document was rebound to a different remote path.
    DidChangePath {
        /// New remote path.
        path: String,
    },
    /// A save is about to write the current text.
    WillSave {
        /// Target path of the save.
        path: String,
    },
    /// A save finished and the remote file now holds the saved snapshot.
    DidSave {
        /// Path that was written.
        path: String,
        /// Save generation after this save completed.
        generation: u64,
    },
    /// Local edits and an independent remote change both exist.
    DidConflict,
    /// The remote watcher reported an error.
    WillThrowWatchError {
        /// Error message from the watcher.
        message: String,
    },
    /// The document's modified status flipped.
    ModifiedStatusChanged {
        /// Whether the text now differs from the cached disk contents.
        modified: bool,
    },
    /// The text changed.
    DidChangeText {
        /// True when the text was replaced wholesale instead of diffed.
        #[serde(rename = "fullReplace")]
        full_replace: bool,
    },
    /// The text was replaced with freshly read remote contents.
    DidReload,
    /// The document was destroyed.
    DidDestroy,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(E) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let weak: Weak<Self> = Arc::downgrade(self);
        let bus: Weak<dyn Unsubscribe> = weak;
        Subscription { bus, id }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe or emit again.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<E: Send + 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // Never blocks on a callback: emit releases the lock before dispatching.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}
