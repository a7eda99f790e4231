//! Save protocol for synced documents.
//!
//! `SyncedDocument::save_as` is the raw protocol and returns errors to its
//! caller. `SaveCoordinator` sits between it and the user-facing layer: it
//! never fails, reports failures with a severity, and recovers the unsaved
//! text into a new untitled document when the saved one was destroyed while
//! the save was outstanding.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::document::{Result, SyncError, SyncedDocument};
use crate::events::DocumentEvent;
use crate::paths;

impl SyncedDocument {
    /// Save to the document's current path.
    pub async fn save(&self) -> Result<u64> {
        let path = self
            .path()
            .ok_or_else(|| SyncError::InvalidArgument("document has no path".into()))?;
        self.save_as(&path).await
    }

    /// Save the current text to `target`, rebinding the document to it.
    ///
    /// Returns the save generation reached by this save.
    pub async fn save_as(&self, target: &str) -> Result<u64> {
        if target.is_empty() {
            return Err(SyncError::InvalidArgument("save target path is empty".into()));
        }
        let target = paths::normalize(target);
        let inner = &self.inner;
        inner.check_bindable()?;

        inner.emit_all([DocumentEvent::WillSave {
            path: target.clone(),
        }]);
        inner.set_path(&target)?;

        let (remote, snapshot, bytes) = {
            let mut state = inner.lock_state();
            let remote = state.remote.clone().ok_or(SyncError::Unbound)?;
            let snapshot = state.buffer.text();
            let bytes = inner.options.encoding.encode(&snapshot)?;
            state.pending_save_content = Some(snapshot.clone());
            (remote, snapshot, bytes)
        };

        debug!("Writing {} bytes to {}", bytes.len(), target);
        match remote.write(&bytes).await {
            Ok(()) => {
                let (generation, event) = {
                    let mut state = inner.lock_state();
                    state.cached_disk_contents = Some(snapshot);
                    state.save_generation += 1;
                    state.conflict = false;
                    state.pending_save_content = None;
                    state.exists = true;
                    (state.save_generation, state.modified_status_event())
                };
                info!("Saved {} (generation {})", target, generation);
                inner.emit_all(event.into_iter().chain([DocumentEvent::DidSave {
                    path: target,
                    generation,
                }]));
                Ok(generation)
            }
            Err(e) => {
                inner.lock_state().pending_save_content = None;
                Err(e.into())
            }
        }
    }
}

/// How loudly a save failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Transient, e.g. a timeout on an unstable connection.
    Warning,
    Error,
}

impl Severity {
    pub fn of(error: &SyncError) -> Self {
        if error.is_timeout() {
            Severity::Warning
        } else {
            Severity::Error
        }
    }
}

/// A failed save, as reported to the user-facing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFailure {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

/// Receives save failures for display.
pub trait SaveNotifier: Send + Sync {
    fn save_failed(&self, failure: &SaveFailure);
}

/// Result of `SaveCoordinator::save`.
pub enum SaveOutcome {
    Saved {
        generation: u64,
    },
    Failed {
        error: SyncError,
    },
    /// The document was destroyed mid-save; its unsaved text now lives in `document`.
    Recovered {
        error: SyncError,
        document: SyncedDocument,
    },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

/// Runs saves on behalf of the user-facing layer.
#[derive(Clone, Default)]
pub struct SaveCoordinator {
    notifier: Option<Arc<dyn SaveNotifier>>,
}

impl SaveCoordinator {
    pub fn new(notifier: Arc<dyn SaveNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }

    /// Save `document` to `target`. Failures are logged, reported and returned
    /// in the outcome rather than as an error.
    pub async fn save(&self, document: &SyncedDocument, target: &str) -> SaveOutcome {
        let error = match document.save_as(target).await {
            Ok(generation) => return SaveOutcome::Saved { generation },
            Err(error) => error,
        };

        let display = if target.is_empty() { "<empty path>" } else { target };
        let severity = Severity::of(&error);
        let message = format!("Failed to save {}: {}", display, error);
        match severity {
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
        if let Some(notifier) = &self.notifier {
            notifier.save_failed(&SaveFailure {
                path: target.to_string(),
                message,
                severity,
            });
        }

        let write_attempted = !matches!(error, SyncError::InvalidArgument(_));
        if write_attempted && document.is_destroyed() {
            let unsaved = document.text();
            match SyncedDocument::untitled(
                document.connection(),
                &unsaved,
                document.options().clone(),
            ) {
                Ok(recovered) => {
                    warn!(
                        "Document {} was closed during a failed save, reopened its text as {}",
                        document.id(),
                        recovered.id()
                    );
                    return SaveOutcome::Recovered {
                        error,
                        document: recovered,
                    };
                }
                Err(e) => error!("Could not recover unsaved text of {}: {}", document.id(), e),
            }
        }

        SaveOutcome::Failed { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::DocumentOptions;
    use crate::remote::{InMemoryConnection, RemoteError};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        failures: Mutex<Vec<SaveFailure>>,
    }

    impl SaveNotifier for RecordingNotifier {
        fn save_failed(&self, failure: &SaveFailure) {
            self.failures.lock().unwrap().push(failure.clone());
        }
    }

    async fn open(connection: &Arc<InMemoryConnection>, path: &str) -> SyncedDocument {
        SyncedDocument::open(connection.clone(), path, DocumentOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_save_updates_state() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/a.txt", "v1");
        let document = open(&connection, "/a.txt").await;
        document.set_text("v2").unwrap();

        let generation = document.save().await.unwrap();

        let snapshot = document.snapshot();
        assert_eq!(generation, 1);
        assert_eq!(snapshot.save_generation, 1);
        assert_eq!(snapshot.cached_disk_contents.as_deref(), Some("v2"));
        assert!(!snapshot.conflict);
        assert!(!snapshot.modified);
        assert_eq!(snapshot.pending_save_content, None);
        assert_eq!(connection.contents("/a.txt").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_save_as_rebinds_path() {
        let connection = Arc::new(InMemoryConnection::new());
        let document = SyncedDocument::untitled(
            Some(connection.clone()),
            "draft",
            DocumentOptions::default(),
        )
        .unwrap();

        document.save_as("/drafts/one.txt").await.unwrap();

        assert_eq!(document.path().as_deref(), Some("/drafts/one.txt"));
        assert!(document.exists());
        assert_eq!(connection.contents("/drafts/one.txt").as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn test_empty_target_fails_before_write() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/a.txt", "v1");
        let document = open(&connection, "/a.txt").await;
        document.set_text("edited").unwrap();
        let before = document.snapshot();

        let result = document.save_as("").await;

        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
        assert_eq!(connection.write_calls(), 0);
        assert_eq!(document.snapshot(), before);
    }

    #[tokio::test]
    async fn test_unbindable_document_fails_without_events() {
        let document = SyncedDocument::untitled(None, "draft", DocumentOptions::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = document.subscribe(move |event| sink.lock().unwrap().push(event));

        assert!(matches!(document.save_as("/a.txt").await, Err(SyncError::Unbound)));

        let connection = Arc::new(InMemoryConnection::new());
        let closed = SyncedDocument::untitled(Some(connection.clone()), "draft", DocumentOptions::default())
            .unwrap();
        closed.destroy();
        let sink = Arc::clone(&seen);
        let _closed_sub = closed.subscribe(move |event| sink.lock().unwrap().push(event));
        assert!(matches!(closed.save_as("/a.txt").await, Err(SyncError::Closed)));

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(connection.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cached_contents_and_conflict() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/a.txt", "v1");
        let document = open(&connection, "/a.txt").await;
        document.set_text("v2").unwrap();
        connection.fail_next_write("/a.txt", RemoteError::Failure("disk full".into()));

        let result = document.save().await;

        assert!(matches!(result, Err(SyncError::Remote(RemoteError::Failure(_)))));
        let snapshot = document.snapshot();
        assert_eq!(snapshot.cached_disk_contents.as_deref(), Some("v1"));
        assert_eq!(snapshot.save_generation, 0);
        assert_eq!(snapshot.pending_save_content, None);
        assert!(snapshot.modified);
    }

    #[tokio::test]
    async fn test_pending_content_visible_only_while_writing() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/a.txt", "v1");
        let document = open(&connection, "/a.txt").await;
        document.set_text("v2").unwrap();
        let gate = connection.gate_next_write("/a.txt");

        let saving = document.clone();
        let save = tokio::spawn(async move { saving.save().await });
        gate.entered().await;
        assert_eq!(document.pending_save_content().as_deref(), Some("v2"));

        gate.release();
        save.await.unwrap().unwrap();
        assert_eq!(document.pending_save_content(), None);
    }

    #[tokio::test]
    async fn test_coordinator_reports_severity_by_cause() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/a.txt", "v1");
        let document = open(&connection, "/a.txt").await;
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = SaveCoordinator::new(notifier.clone());

        connection.fail_next_write("/a.txt", RemoteError::Timeout("10s".into()));
        let outcome = coordinator.save(&document, "/a.txt").await;
        assert!(matches!(outcome, SaveOutcome::Failed { .. }));

        connection.fail_next_write("/a.txt", RemoteError::Failure("EACCES".into()));
        coordinator.save(&document, "/a.txt").await;

        let outcome = coordinator.save(&document, "").await;
        assert!(matches!(
            outcome,
            SaveOutcome::Failed { error: SyncError::InvalidArgument(_) }
        ));

        let failures = notifier.failures.lock().unwrap().clone();
        let severities: Vec<_> = failures.iter().map(|f| f.severity).collect();
        assert_eq!(severities, vec![Severity::Warning, Severity::Error, Severity::Error]);
        assert!(failures[0].message.contains("/a.txt"));

        assert!(coordinator.save(&document, "/a.txt").await.is_saved());
    }

    #[tokio::test]
    async fn test_destroyed_during_failed_save_recovers_text() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/a.txt", "v1");
        let document = open(&connection, "/a.txt").await;
        document.set_text("precious edits").unwrap();
        connection.fail_next_write("/a.txt", RemoteError::Failure("connection lost".into()));
        let gate = connection.gate_next_write("/a.txt");

        let coordinator = SaveCoordinator::default();
        let saving = document.clone();
        let save = tokio::spawn(async move { coordinator.save(&saving, "/a.txt").await });
        gate.entered().await;
        document.destroy();
        gate.release();

        match save.await.unwrap() {
            SaveOutcome::Recovered { document: recovered, .. } => {
                assert_eq!(recovered.text(), "precious edits");
                assert_eq!(recovered.path(), None);
                assert!(recovered.is_modified());
                assert!(!recovered.is_destroyed());
            }
            _ => panic!("expected the unsaved text to be recovered"),
        }
    }
}
