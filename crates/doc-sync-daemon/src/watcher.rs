//! File watcher with debouncing for a single synced file.
//!
//! Uses notify-debouncer-mini on the file's parent directory, since the file
//! itself may be replaced (editors write-and-rename) or not exist yet.

use anyhow::{Context, Result};
use doc_sync_core::RemoteEvent;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Last seen mtime, to filter spurious modify events.
type MtimeCache = Arc<Mutex<Option<SystemTime>>>;

/// Watches one file and forwards change, delete and error notifications.
pub struct FileWatcher {
    path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl FileWatcher {
    /// Start watching `path`. The parent directory must exist.
    pub fn new(path: &Path, events: mpsc::UnboundedSender<RemoteEvent>) -> Result<Self> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        let file_name = path
            .file_name()
            .with_context(|| format!("{} has no file name", path.display()))?;
        // FSEvents reports canonical paths (/private/var/... on macOS).
        let parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
        let path = parent.join(file_name);

        let watched = path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(None));

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(debounced) => {
                    for event in debounced {
                        if let Some(remote_event) = Self::process_event(&event, &watched, &mtime_cache)
                        {
                            if events.send(remote_event).is_err() {
                                // Subscription dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error for {}: {}", watched.display(), e);
                    let _ = events.send(RemoteEvent::WatchError(e.to_string()));
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", parent.display()))?;
        debug!("Watching {}", path.display());

        Ok(Self {
            path,
            _debouncer: debouncer,
        })
    }

    fn process_event(
        event: &DebouncedEvent,
        watched: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<RemoteEvent> {
        if event.path.as_path() != watched {
            return None;
        }

        let exists = watched.exists();

        let mut last_mtime = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        if !exists {
            *last_mtime = None;
            debug!("File event: deleted - {}", watched.display());
            return Some(RemoteEvent::Deleted);
        }

        if let Ok(mtime) = std::fs::metadata(watched).and_then(|m| m.modified()) {
            if *last_mtime == Some(mtime) {
                return None;
            }
            *last_mtime = Some(mtime);
        }
        debug!("File event: changed - {}", watched.display());
        Some(RemoteEvent::Changed)
    }

    /// The watched file (with a canonical parent directory).
    pub fn path(&self) -> &Path {
        &self.path
    }
}
