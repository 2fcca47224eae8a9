//! Remote index access.
//!
//! The remote index is a paginated, directory-shaped listing API. Every call
//! made against it goes through the [`RetryExecutor`].

pub mod client;
pub mod retry;
pub mod walker;

pub use client::AlistClient;
pub use retry::RetryExecutor;
pub use walker::{RemoteWalker, WalkItem};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A file or directory reported by the remote index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Absolute remote path, always starting with `/`.
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
    /// Provider signature appended to download URLs.
    pub sign: String,
    pub hash: Option<String>,
    /// Direct download URL, only present on `get_info` responses.
    pub raw_url: Option<String>,
}

impl RemoteEntry {
    pub fn file(parent: &str, name: &str, size: u64) -> Self {
        Self {
            path: join_remote_path(parent, name),
            name: name.to_string(),
            is_dir: false,
            size,
            modified: None,
            sign: String::new(),
            hash: None,
            raw_url: None,
        }
    }

    pub fn dir(parent: &str, name: &str) -> Self {
        Self {
            is_dir: true,
            ..Self::file(parent, name, 0)
        }
    }

    pub fn with_sign(mut self, sign: impl Into<String>) -> Self {
        self.sign = sign.into();
        self
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub entries: Vec<RemoteEntry>,
    /// Total number of entries in the directory as reported by the index.
    pub total: u64,
}

/// Remote index operations.
#[async_trait]
pub trait RemoteIndex: Send + Sync {
    /// List one page (1-based) of a directory.
    async fn list_page(&self, path: &str, page: u32, per_page: u32) -> Result<RemotePage>;

    /// Fetch details of a single path.
    async fn get_info(&self, path: &str) -> Result<RemoteEntry>;

    /// Download the raw bytes of a file.
    async fn fetch_bytes(&self, entry: &RemoteEntry) -> Result<Bytes>;

    /// Page size to use when the caller has no preference.
    fn default_per_page(&self) -> u32 {
        crate::config::DEFAULT_PER_PAGE
    }
}

/// Join a remote directory and a child name with exactly one separator.
pub fn join_remote_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{}/{}", parent, name.trim_start_matches('/'))
}

/// Reject paths the index API cannot address.
///
/// A valid path is non-empty, absolute and free of control characters.
pub fn validate_remote_path(path: &str) -> Result<()> {
    if path.is_empty() || !path.starts_with('/') || path.chars().any(char::is_control) {
        return Err(Error::InvalidRemotePath(path.to_string()));
    }
    Ok(())
}

/// Percent-encode every segment of a remote path, keeping the separators.
pub fn encode_remote_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_remote_path() {
        assert!(validate_remote_path("/movies/a b.mp4").is_ok());
        assert!(validate_remote_path("").is_err());
        assert!(validate_remote_path("movies/a.mp4").is_err());
        assert!(validate_remote_path("/movies/a\nb.mp4").is_err());
        assert!(validate_remote_path("/movies/a\u{0}b.mp4").is_err());
    }

    #[test]
    fn test_encode_remote_path() {
        assert_eq!(
            encode_remote_path("/电影/a b#1.mp4"),
            "/%E7%94%B5%E5%BD%B1/a%20b%231.mp4"
        );
        assert_eq!(encode_remote_path("/"), "/");
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/", "movies"), "/movies");
        assert_eq!(join_remote_path("/movies/", "a.mp4"), "/movies/a.mp4");
        assert_eq!(join_remote_path("/movies", "/a.mp4"), "/movies/a.mp4");
        assert_eq!(join_remote_path("", "a.mp4"), "/a.mp4");
    }
}
