//! Content-addressed cache for downloaded artifacts.
//!
//! Unlike the general-purpose LRU cache elsewhere in this codebase, cache
//! entries here are keyed by their own checksum and never expire
//! implicitly — a hit is only possible when the download spec already
//! names the checksum it expects, which is what makes the entry trustworthy
//! without re-verifying. Expiry is opt-in via [`ContentCache::gc`].

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, info};

use crate::error::DownloadError;

/// A directory of `<algorithm>_<hex>`-named artifacts.
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key(algorithm: &str, hex_digest: &str) -> String {
        format!("{}_{}", algorithm, hex_digest.to_lowercase())
    }

    pub fn entry_path(&self, algorithm: &str, hex_digest: &str) -> PathBuf {
        self.dir.join(Self::key(algorithm, hex_digest))
    }

    pub async fn contains(&self, algorithm: &str, hex_digest: &str) -> bool {
        fs::metadata(self.entry_path(algorithm, hex_digest)).await.is_ok()
    }

    /// Populates the cache by copying `source` to `<algorithm>_<hex>` via a
    /// temp file + atomic rename, so two concurrent writers of identical
    /// content never race destructively.
    pub async fn insert(&self, algorithm: &str, hex_digest: &str, source: &Path) -> Result<PathBuf, DownloadError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| io_err(&self.dir, e))?;
        let dest = self.entry_path(algorithm, hex_digest);
        let tmp = self.dir.join(format!(".{}.tmp", Self::key(algorithm, hex_digest)));
        if fs::metadata(source).await.map_err(|e| io_err(source, e))?.is_dir() {
            copy_dir_recursive(source, &tmp).await.map_err(|e| io_err(&tmp, e))?;
        } else {
            fs::copy(source, &tmp).await.map_err(|e| io_err(&tmp, e))?;
        }
        fs::rename(&tmp, &dest).await.map_err(|e| io_err(&dest, e))?;
        debug!(path = %dest.display(), "populated download cache entry");
        Ok(dest)
    }

    /// Removes cache entries older than `max_age`.
    pub async fn gc(&self, max_age: Duration) -> Result<usize, DownloadError> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&self.dir, e)),
        };
        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.dir, e))? {
            let meta = entry.metadata().await.map_err(|e| io_err(&entry.path(), e))?;
            if let Ok(modified) = meta.modified() {
                if now.duration_since(modified).unwrap_or_default() > max_age {
                    if meta.is_dir() {
                        let _ = fs::remove_dir_all(entry.path()).await;
                    } else {
                        let _ = fs::remove_file(entry.path()).await;
                    }
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "garbage collected stale cache entries");
        }
        Ok(removed)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> DownloadError {
    DownloadError::Io { path: path.display().to_string(), source }
}

fn copy_dir_recursive<'a>(src: &'a Path, dst: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let ty = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if ty.is_dir() {
                copy_dir_recursive(&entry.path(), &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_contains() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache"));
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"hello").await.unwrap();
        assert!(!cache.contains("sha256", "deadbeef").await);
        cache.insert("sha256", "deadbeef", &src).await.unwrap();
        assert!(cache.contains("sha256", "deadbeef").await);
    }

    #[tokio::test]
    async fn gc_removes_only_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::new(dir.path().join("cache"));
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"hello").await.unwrap();
        cache.insert("sha256", "aaaa", &src).await.unwrap();
        let removed = cache.gc(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
    }
}
