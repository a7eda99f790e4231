//! Integration tests for the native connection and watcher.
//!
//! Watcher tests wait on real filesystem notifications, so they use generous
//! timeouts.

use std::sync::Arc;
use std::time::Duration;

use doc_sync_core::{
    ConfigDirectoryCache, Connection, DocumentOptions, RemoteError, RemoteEvent, RemoteFile,
    SyncedDocument,
};
use doc_sync_daemon::{FileWatcher, NativeConnection};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn connection(dir: &TempDir) -> Arc<NativeConnection> {
    Arc::new(NativeConnection::new(
        dir.path().to_path_buf(),
        Duration::from_secs(5),
    ))
}

/// Poll `check` until it holds or `WAIT` elapses.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_read_write_and_missing_files() {
    let dir = TempDir::new().unwrap();
    let connection = connection(&dir);
    let file = connection.open_file("/nested/dir/note.txt");

    assert_eq!(
        file.read().await,
        Err(RemoteError::NotFound("/nested/dir/note.txt".into()))
    );

    file.write(b"hello").await.unwrap();
    assert_eq!(file.read().await.unwrap(), b"hello");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("nested/dir/note.txt")).unwrap(),
        "hello"
    );
}

#[tokio::test]
async fn test_exists_and_is_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
    std::fs::write(dir.path().join("a/file.txt"), "x").unwrap();
    let connection = connection(&dir);

    assert!(connection.exists("/a/b").await.unwrap());
    assert!(!connection.exists("/a/missing").await.unwrap());
    assert!(connection.is_directory("/a/b").await.unwrap());
    assert!(!connection.is_directory("/a/file.txt").await.unwrap());
    assert!(matches!(
        connection.is_directory("/nope").await,
        Err(RemoteError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_config_dir_on_disk() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("project/src/deep")).unwrap();
    std::fs::write(dir.path().join("project/.hhconfig"), "").unwrap();
    std::fs::write(dir.path().join("project/src/deep/main.php"), "<?hh").unwrap();
    let cache = ConfigDirectoryCache::new(connection(&dir), ".hhconfig");

    assert_eq!(
        cache.get_config_dir("/project/src/deep/main.php").await.as_deref(),
        Some("/project")
    );
    assert_eq!(cache.get_config_dir("/project/src").await.as_deref(), Some("/project"));
    assert_eq!(cache.get_config_dir("/").await, None);
}

#[tokio::test]
async fn test_watcher_reports_change_and_delete() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("watched.txt");
    std::fs::write(&path, "v1").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = FileWatcher::new(&path, tx).unwrap();
    // Let the watcher settle before touching the file.
    sleep(Duration::from_millis(100)).await;

    std::fs::write(dir.path().join("other.txt"), "ignored").unwrap();
    std::fs::write(&path, "v2").unwrap();
    let event = timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(event, Some(RemoteEvent::Changed));

    std::fs::remove_file(&path).unwrap();
    let event = timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(event, Some(RemoteEvent::Deleted));
}

#[tokio::test]
async fn test_watching_missing_directory_reports_watch_error() {
    let dir = TempDir::new().unwrap();
    let connection = connection(&dir);
    let file = connection.open_file("/does/not/exist.txt");

    let mut events = file.subscribe();
    assert!(matches!(events.try_recv(), Ok(RemoteEvent::WatchError(_))));
}

#[tokio::test]
async fn test_document_reloads_external_edit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("doc.txt");
    std::fs::write(&path, "one\ntwo\n").unwrap();

    let document = SyncedDocument::open(connection(&dir), "/doc.txt", DocumentOptions::default())
        .await
        .unwrap();
    assert_eq!(document.text(), "one\ntwo\n");
    sleep(Duration::from_millis(100)).await;

    std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

    assert!(eventually(|| document.text() == "one\ntwo\nthree\n").await);
    assert!(!document.is_in_conflict());
}

#[tokio::test]
async fn test_document_conflict_on_external_edit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("doc.txt");
    std::fs::write(&path, "base").unwrap();

    let document = SyncedDocument::open(connection(&dir), "/doc.txt", DocumentOptions::default())
        .await
        .unwrap();
    document.set_text("local edit").unwrap();
    sleep(Duration::from_millis(100)).await;

    std::fs::write(&path, "external edit").unwrap();

    assert!(eventually(|| document.is_in_conflict()).await);
    assert_eq!(document.text(), "local edit");

    // Saving resolves the conflict in favor of the local text.
    document.save().await.unwrap();
    assert!(!document.is_in_conflict());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "local edit");
}
