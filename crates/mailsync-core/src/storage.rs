//! Object storage for attachment bytes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use tracing::debug;

use crate::Result;

/// Destination for attachment bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` and returns a URL that locates them.
    async fn upload(&self, filename: &str, bytes: &[u8], mime_type: &str) -> Result<String>;
}

/// Stores objects as files below a root directory, one folder per day.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    counter: AtomicU64,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`. Directories are created on upload.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, filename: &str) -> PathBuf {
        let now = Utc::now();
        let unique = format!(
            "{}-{}",
            now.timestamp_nanos_opt().unwrap_or_default(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        self.root
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()))
            .join(format!("{unique}-{}", sanitize_filename(filename)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, filename: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        let path = self.object_path(filename);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        let absolute = tokio::fs::canonicalize(&path).await?;
        let url = format!("file://{}", absolute.display());
        debug!(%url, mime_type, size = bytes.len(), "object stored");
        Ok(url)
    }
}

/// Reduces a client-supplied name to a safe single path component.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return "attachment".to_string();
    }
    trimmed.chars().take(128).collect()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b:c"), "a_b_c");
        assert_eq!(sanitize_filename("..."), "attachment");
        assert_eq!(sanitize_filename("  "), "attachment");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 128);
    }

    #[tokio::test]
    async fn uploads_land_below_root() {
        let root = std::env::temp_dir().join(format!("mailsync-objects-{}", std::process::id()));
        let store = FsObjectStore::new(&root);

        let first = store.upload("a.txt", b"one", "text/plain").await.unwrap();
        let second = store.upload("a.txt", b"two", "text/plain").await.unwrap();
        assert_ne!(first, second);

        let path = first.strip_prefix("file://").unwrap();
        assert!(path.ends_with("-a.txt"));
        assert_eq!(std::fs::read(path).unwrap(), b"one");

        std::fs::remove_dir_all(&root).unwrap();
    }
}
