//! Explicit registry of remote connections, keyed by host name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config_dir::ConfigDirectoryCache;
use crate::document::{Result, SyncError, SyncedDocument};
use crate::encoding::DocumentOptions;
use crate::remote::Connection;
use crate::uri::RemoteUri;

/// Connections available to this process.
///
/// Passed to whatever opens documents or resolves configuration roots; there
/// is no global instance.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<dyn Connection>>>,
    config_caches: RwLock<HashMap<(String, String), ConfigDirectoryCache>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` for `host`, replacing any previous one.
    pub fn register(&self, host: &str, connection: Arc<dyn Connection>) {
        info!("Registered connection for {}", host);
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_string(), connection);
        // Caches answer for the old connection's filesystem.
        self.drop_caches(host);
    }

    /// Remove the connection for `host`. Returns it if one was registered.
    pub fn unregister(&self, host: &str) -> Option<Arc<dyn Connection>> {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host);
        if removed.is_some() {
            info!("Unregistered connection for {}", host);
            self.drop_caches(host);
        }
        removed
    }

    pub fn get(&self, host: &str) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .cloned()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }

    fn require(&self, host: &str) -> Result<Arc<dyn Connection>> {
        self.get(host)
            .ok_or_else(|| SyncError::UnknownHost(host.to_string()))
    }

    /// Open the document named by `uri` on its host's connection.
    pub async fn open_document(
        &self,
        uri: &RemoteUri,
        options: DocumentOptions,
    ) -> Result<SyncedDocument> {
        let connection = self.require(uri.host())?;
        SyncedDocument::open(connection, uri.path(), options).await
    }

    /// The shared configuration-root cache for `host` and `marker`.
    pub fn config_cache(&self, host: &str, marker: &str) -> Result<ConfigDirectoryCache> {
        let key = (host.to_string(), marker.to_string());
        if let Some(cache) = self
            .config_caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(cache.clone());
        }

        let connection = self.require(host)?;
        let mut caches = self
            .config_caches
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let cache = caches.entry(key).or_insert_with(|| {
            debug!("Created {} cache for {}", marker, host);
            ConfigDirectoryCache::new(connection, marker)
        });
        Ok(cache.clone())
    }

    fn drop_caches(&self, host: &str) {
        self.config_caches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(cache_host, _), _| cache_host != host);
    }
}
