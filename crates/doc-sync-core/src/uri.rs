//! RemoteUri: `remote://<host>/<path>` identifiers for files on a remote store.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

use crate::paths;

pub const SCHEME: &str = "remote://";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("Invalid remote URI (expected remote://<host>/<path>): {0}")]
    InvalidFormat(String),
    #[error("Remote URI has an empty host: {0}")]
    EmptyHost(String),
}

/// A file on a named remote host.
///
/// # Examples
/// ```
/// use doc_sync_core::RemoteUri;
///
/// let uri: RemoteUri = "remote://build-box/home/me/notes.txt".parse().unwrap();
/// assert_eq!(uri.host(), "build-box");
/// assert_eq!(uri.path(), "/home/me/notes.txt");
/// assert_eq!(uri.to_string(), "remote://build-box/home/me/notes.txt");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteUri {
    host: String,
    path: String,
}

impl RemoteUri {
    pub fn new(host: &str, path: &str) -> Self {
        Self {
            host: host.to_string(),
            path: paths::normalize(&format!("/{}", path)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Display for RemoteUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SCHEME, self.host, self.path)
    }
}

impl FromStr for RemoteUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| UriError::InvalidFormat(s.to_string()))?;
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, path),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(UriError::EmptyHost(s.to_string()));
        }
        Ok(Self::new(host, path))
    }
}
