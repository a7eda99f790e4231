//! Conflict reconciliation for remote change, delete and watch-error notifications.
//!
//! Runs only on the document's queue task, so at most one reconciliation per
//! document is in flight. The remote read is the only suspension point; the
//! state lock is never held across it.
//!
//! After a change notification the refreshed contents are resolved in order:
//!
//! 1. The document was rebound during the read: discard the contents, they
//!    belong to the previous file.
//! 2. A save completed during the read: clear the conflict. The change caused
//!    by that save's write is reconciled by its own notification.
//! 3. Contents equal what was cached before: a false alarm, clear the conflict.
//! 4. Contents equal the snapshot an in-flight save is writing, or the local
//!    text itself: clear the conflict.
//! 5. Local edits existed: raise a conflict and keep the local text.
//! 6. Otherwise reload the text from the refreshed contents.

use tracing::{debug, info, warn};

use crate::document::{Inner, Job, Result, SyncError};
use crate::encoding::DeletePolicy;
use crate::events::DocumentEvent;
use crate::remote::{RemoteError, RemoteEvent};

impl Inner {
    pub(crate) async fn handle_remote_event(&self, event: RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::Changed => self.reconcile_change().await,
            RemoteEvent::Deleted => self.reconcile_delete().await,
            RemoteEvent::WatchError(message) => {
                warn!("Watch error for document {}: {}", self.id, message);
                self.emit_all([DocumentEvent::WillThrowWatchError { message }]);
                Ok(())
            }
        }
    }

    async fn reconcile_change(&self) -> Result<()> {
        let (remote, epoch, raised_conflict, previous_contents, previous_generation, text_before_read) = {
            let mut state = self.lock_state();
            let Some(remote) = state.remote.clone() else {
                debug!("Ignoring change for unbound document {}", self.id);
                return Ok(());
            };
            let raised_conflict = !state.conflict && state.is_modified();
            if raised_conflict {
                state.conflict = true;
            }
            (
                remote,
                state.binding_epoch,
                raised_conflict,
                state.cached_disk_contents.clone(),
                state.save_generation,
                state.buffer.text(),
            )
        };

        let bytes = match remote.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let mut state = self.lock_state();
                if state.binding_epoch == epoch {
                    state.exists = false;
                }
                return Err(e.into());
            }
        };
        let contents = self.options.encoding.decode(&bytes)?;

        let mut events = Vec::new();
        {
            let mut state = self.lock_state();

            if state.binding_epoch != epoch {
                debug!("Document {} rebound during refresh of {}, discarding", self.id, remote.path());
                if raised_conflict {
                    state.conflict = false;
                }
                return Ok(());
            }

            if state.save_generation != previous_generation {
                // Keep the saved snapshot as the cached contents; the read may predate it.
                debug!("Save finished during refresh of {}, clearing conflict", remote.path());
                state.conflict = false;
            } else {
                state.cached_disk_contents = Some(contents.clone());
                state.exists = true;

                if previous_contents.as_deref() == Some(contents.as_str()) {
                    state.conflict = false;
                } else if state.pending_save_content.as_deref() == Some(contents.as_str()) {
                    state.conflict = false;
                } else if state.buffer.text() == contents {
                    // Local edits already match the remote.
                    state.conflict = false;
                } else if state.conflict {
                    info!("Conflict detected for {}", remote.path());
                    events.push(DocumentEvent::DidConflict);
                } else if state.buffer.text() != text_before_read {
                    // Edited while the read was outstanding.
                    info!("Conflict detected for {} (edited during refresh)", remote.path());
                    state.conflict = true;
                    events.push(DocumentEvent::DidConflict);
                } else {
                    state.buffer.set_text_via_diff(&contents)?;
                    debug!("Reloaded {} from remote", remote.path());
                    events.push(DocumentEvent::DidReload);
                }
            }

            events.extend(state.modified_status_event());
        }

        self.emit_all(events);
        Ok(())
    }

    async fn reconcile_delete(&self) -> Result<()> {
        let (modified, remote, epoch) = {
            let mut state = self.lock_state();
            state.exists = false;
            let modified = state.is_modified();
            state.was_modified_before_remove = modified;
            (modified, state.remote.clone(), state.binding_epoch)
        };

        if modified {
            let Some(remote) = remote else {
                return Ok(());
            };
            info!("{} deleted remotely, keeping local edits", remote.path());
            return match remote.read().await {
                Ok(bytes) => {
                    // Recreated between the delete and this refresh.
                    let contents = self.options.encoding.decode(&bytes)?;
                    let event = {
                        let mut state = self.lock_state();
                        if state.binding_epoch != epoch {
                            return Ok(());
                        }
                        state.cached_disk_contents = Some(contents);
                        state.exists = true;
                        state.modified_status_event()
                    };
                    self.emit_all(event);
                    Ok(())
                }
                Err(RemoteError::NotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        match self.options.delete_policy {
            DeletePolicy::Destroy => {
                debug!("Unmodified document {} deleted remotely, destroying", self.id);
                self.destroy();
            }
            DeletePolicy::SoftDelete => {
                debug!("Unmodified document {} deleted remotely, detaching", self.id);
                let event = {
                    let mut state = self.lock_state();
                    state.path = None;
                    state.remote = None;
                    state.binding_epoch += 1;
                    state.cached_disk_contents = None;
                    state.conflict = false;
                    state.modified_status_event()
                };
                self.send(Job::Rebind(None))?;
                self.emit_all(event);
            }
        }
        Ok(())
    }

    /// Replace the text with the remote contents, dropping local edits.
    pub(crate) async fn reload_from_remote(&self) -> Result<()> {
        let (remote, epoch) = {
            let state = self.lock_state();
            let Some(remote) = state.remote.clone() else {
                return Err(SyncError::Unbound);
            };
            (remote, state.binding_epoch)
        };

        let bytes = match remote.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let mut state = self.lock_state();
                if matches!(e, RemoteError::NotFound(_)) && state.binding_epoch == epoch {
                    state.exists = false;
                }
                return Err(e.into());
            }
        };
        let contents = self.options.encoding.decode(&bytes)?;

        let event = {
            let mut state = self.lock_state();
            if state.binding_epoch != epoch {
                debug!("Document {} rebound during reload, discarding", self.id);
                return Ok(());
            }
            state.buffer.set_text_via_diff(&contents)?;
            state.cached_disk_contents = Some(contents);
            state.exists = true;
            state.conflict = false;
            state.modified_status_event()
        };
        info!("Reloaded {} from remote", remote.path());
        self.emit_all([DocumentEvent::DidReload].into_iter().chain(event));
        Ok(())
    }
}
