//! Nearest-ancestor lookup of configuration roots.
//!
//! A configuration root is a directory holding a marker file (e.g. `.hhconfig`).
//! Answers are memoized for every directory a walk visits and never expire.
//! Concurrent lookups for the same start path share one walk.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::paths;
use crate::remote::Connection;

type Lookup = Shared<BoxFuture<'static, Option<String>>>;

struct CacheInner {
    connection: Arc<dyn Connection>,
    marker: String,
    resolved: Mutex<HashMap<String, Option<String>>>,
    in_flight: Mutex<HashMap<String, Lookup>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CacheInner {
    fn cached(&self, dir: &str) -> Option<Option<String>> {
        lock(&self.resolved).get(dir).cloned()
    }

    fn record(&self, visited: &[String], answer: &Option<String>) {
        let mut resolved = lock(&self.resolved);
        for dir in visited {
            resolved.insert(dir.clone(), answer.clone());
        }
    }

    async fn walk(&self, start: &str) -> Option<String> {
        let mut visited = vec![start.to_string()];

        let mut current = match self.connection.is_directory(start).await {
            Ok(false) => paths::parent(start),
            Ok(true) => Some(start.to_string()),
            Err(e) => {
                trace!("Could not stat {}, treating it as a directory: {}", start, e);
                Some(start.to_string())
            }
        };

        while let Some(dir) = current {
            if dir != start {
                if let Some(answer) = self.cached(&dir) {
                    self.record(&visited, &answer);
                    return answer;
                }
                visited.push(dir.clone());
            }

            let marker_path = paths::join(&dir, &self.marker);
            match self.connection.exists(&marker_path).await {
                Ok(true) => {
                    debug!("Found {} in {}", self.marker, dir);
                    let answer = Some(dir);
                    self.record(&visited, &answer);
                    return answer;
                }
                Ok(false) => {}
                Err(e) => debug!("Existence check for {} failed: {}", marker_path, e),
            }
            current = paths::parent(&dir);
        }

        debug!("No {} above {}", self.marker, start);
        self.record(&visited, &None);
        None
    }
}

/// Finds the nearest ancestor directory containing a marker file.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct ConfigDirectoryCache {
    inner: Arc<CacheInner>,
}

impl ConfigDirectoryCache {
    pub fn new(connection: Arc<dyn Connection>, marker: &str) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                connection,
                marker: marker.to_string(),
                resolved: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn marker(&self) -> &str {
        &self.inner.marker
    }

    /// Nearest directory at or above `path` that contains the marker file.
    ///
    /// `path` may name a file, in which case the search starts at its parent.
    /// Failed existence checks count as "no marker here".
    pub async fn get_config_dir(&self, path: &str) -> Option<String> {
        let start = paths::normalize(path);
        if let Some(answer) = self.inner.cached(&start) {
            return answer;
        }

        let lookup = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&start) {
                Some(lookup) => {
                    trace!("Joining in-flight lookup for {}", start);
                    lookup.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let key = start.clone();
                    let lookup = async move {
                        let answer = inner.walk(&key).await;
                        lock(&inner.in_flight).remove(&key);
                        answer
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(start, lookup.clone());
                    lookup
                }
            }
        };

        lookup.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryConnection, RemoteError};

    const MARKER: &str = ".hhconfig";

    fn cache(connection: &Arc<InMemoryConnection>) -> ConfigDirectoryCache {
        ConfigDirectoryCache::new(connection.clone(), MARKER)
    }

    #[tokio::test]
    async fn test_second_lookup_is_a_cache_hit() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_dir("/a/b/c");
        connection.add_file("/a/.hhconfig", "");
        let cache = cache(&connection);

        let first = cache.get_config_dir("/a/b/c").await;
        let calls = connection.exists_calls();
        let second = cache.get_config_dir("/a/b/c").await;

        assert_eq!(first.as_deref(), Some("/a"));
        assert_eq!(first, second);
        assert_eq!(connection.exists_calls(), calls);
    }

    #[tokio::test]
    async fn test_nested_directories_share_root() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_dir("/a/b/c");
        connection.add_file("/a/.hhconfig", "");
        let cache = cache(&connection);

        assert_eq!(cache.get_config_dir("/a/b/c").await.as_deref(), Some("/a"));
        let calls = connection.exists_calls();
        assert_eq!(cache.get_config_dir("/a/b").await.as_deref(), Some("/a"));
        assert_eq!(connection.exists_calls(), calls);
    }

    #[tokio::test]
    async fn test_missing_marker_cached_for_visited_directories() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_dir("/root/sub/sub2");
        let cache = cache(&connection);

        assert_eq!(cache.get_config_dir("/root/sub/sub2").await, None);
        let calls = connection.exists_calls();
        assert_eq!(cache.get_config_dir("/root/sub").await, None);
        assert_eq!(connection.exists_calls(), calls);
    }

    #[tokio::test]
    async fn test_file_start_path_searches_from_parent() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/project/.hhconfig", "");
        connection.add_file("/project/src/main.php", "<?hh");
        let cache = cache(&connection);

        assert_eq!(
            cache.get_config_dir("/project/src/main.php").await.as_deref(),
            Some("/project")
        );
    }

    #[tokio::test]
    async fn test_marker_in_start_directory() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_file("/project/.hhconfig", "");
        let cache = cache(&connection);

        assert_eq!(cache.get_config_dir("/project").await.as_deref(), Some("/project"));
    }

    #[tokio::test]
    async fn test_walk_stops_at_cached_ancestor() {
        let connection = Arc::new(InMemoryConnection::new());
        connection.add_dir("/a/b/c/d");
        connection.add_dir("/a/x");
        connection.add_file("/a/.hhconfig", "");
        let cache = cache(&connection);

        cache.get_config_dir("/a/b").await;
        let calls = connection.exists_calls();
        assert_eq!(cache.get_config_dir("/a/b/c/d").await.as_deref(), Some("/a"));
        // Checked /a/b/c/d and /a/b/c, then hit the cached /a/b.
        assert_eq!(connection.exists_calls(), calls + 2);
    }

    /// Yields before every existence check and fails the one for `failing`.
    struct SlowConnection {
        inner: InMemoryConnection,
        failing: Option<String>,
    }

    #[async_trait::async_trait]
    impl Connection for SlowConnection {
        fn open_file(&self, path: &str) -> Arc<dyn crate::remote::RemoteFile> {
            self.inner.open_file(path)
        }

        async fn exists(&self, path: &str) -> crate::remote::Result<bool> {
            tokio::task::yield_now().await;
            if self.failing.as_deref() == Some(path) {
                return Err(RemoteError::Timeout(path.to_string()));
            }
            self.inner.exists(path).await
        }

        async fn is_directory(&self, path: &str) -> crate::remote::Result<bool> {
            self.inner.is_directory(path).await
        }
    }

    #[tokio::test]
    async fn test_failed_existence_check_continues_walk() {
        let inner = InMemoryConnection::new();
        inner.add_dir("/m/n");
        inner.add_file("/m/.hhconfig", "");
        inner.add_file("/m/n/.hhconfig", "");
        let connection = Arc::new(SlowConnection {
            inner,
            failing: Some("/m/n/.hhconfig".to_string()),
        });
        let cache = ConfigDirectoryCache::new(connection, MARKER);

        assert_eq!(cache.get_config_dir("/m/n").await.as_deref(), Some("/m"));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_coalesce() {
        let inner = InMemoryConnection::new();
        inner.add_dir("/w/x/y");
        inner.add_file("/w/.hhconfig", "");
        let connection = Arc::new(SlowConnection {
            inner: inner.clone(),
            failing: None,
        });
        let cache = ConfigDirectoryCache::new(connection, MARKER);

        let (a, b, c) = tokio::join!(
            cache.get_config_dir("/w/x/y"),
            cache.get_config_dir("/w/x/y"),
            cache.get_config_dir("/w/x/y"),
        );

        assert_eq!(a.as_deref(), Some("/w"));
        assert_eq!(a, b);
        assert_eq!(b, c);
        // One walk: /w/x/y, /w/x, /w.
        assert_eq!(inner.exists_calls(), 3);
        assert!(lock(&cache.inner.in_flight).is_empty());
    }
}
