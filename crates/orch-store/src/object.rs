//! `ObjectStore`: archives, callbacks, init triggers, and terminal artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StoreError;

/// The object-store surface the engine depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` at `path`, overwriting any existing object there
    /// (last-write-wins, for the watchdog/worker callback race).
    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), StoreError>;
    /// Read the object at `path`, or `None` if it does not exist.
    async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// `true` iff an object exists at `path`.
    async fn head_object(&self, path: &str) -> Result<bool, StoreError>;
    /// Generate a presigned PUT URL for `path`, valid for `expiry_secs`.
    async fn presign_put(&self, path: &str, expiry_secs: u64) -> Result<String, StoreError>;
}

/// A file-backed reference implementation of [`ObjectStore`], rooted at a
/// configured directory. Presigned URLs are modeled as `file://` paths
/// bearing an expiry query parameter understood only by this
/// implementation — sufficient for local/test parity; production swaps in
/// a real object-store client behind the same trait.
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Create a store rooted at `root`, creating the directory if absent.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Internal(format!("create_dir_all {parent:?}: {e}")))?;
        }
        tokio::fs::write(&full, body)
            .await
            .map_err(|e| StoreError::Internal(format!("write {full:?}: {e}")))
    }

    async fn get_object(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let full = self.resolve(path);
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Internal(format!("read {full:?}: {e}"))),
        }
    }

    async fn head_object(&self, path: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| StoreError::Internal(format!("try_exists: {e}")))?)
    }

    async fn presign_put(&self, path: &str, expiry_secs: u64) -> Result<String, StoreError> {
        let full = self.resolve(path);
        let expires_at = Utc::now().timestamp() + expiry_secs as i64;
        Ok(format!("file://{}?expires={expires_at}", full.display()))
    }
}

/// Parse the expiry annotation out of a presigned URL produced by
/// [`FileObjectStore::presign_put`]. Returns `None` if the URL is not in
/// the expected shape.
pub fn parse_presigned_expiry(url: &str) -> Option<i64> {
    let (_, query) = url.split_once("?expires=")?;
    query.parse().ok()
}

/// `true` iff `url` was produced by [`FileObjectStore::presign_put`] and
/// has not yet expired, relative to `now`.
pub fn presigned_url_is_valid(url: &str, now: chrono::DateTime<Utc>) -> bool {
    match parse_presigned_expiry(url) {
        Some(expires_at) => now.timestamp() <= expires_at,
        None => false,
    }
}

/// Extract the filesystem path component of a `file://` presigned URL.
pub fn presigned_path(url: &str) -> Option<&Path> {
    let without_scheme = url.strip_prefix("file://")?;
    let (path, _) = without_scheme.split_once('?')?;
    Some(Path::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();
        store.put_object("tmp/exec/run-1/0001/exec.zip", b"hello".to_vec()).await.unwrap();
        let body = store.get_object("tmp/exec/run-1/0001/exec.zip").await.unwrap();
        assert_eq!(body, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_object_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();
        assert_eq!(store.get_object("does/not/exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn head_object_reflects_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();
        assert!(!store.head_object("callbacks/runs/run-1/0000/result.json").await.unwrap());
        store
            .put_object("callbacks/runs/run-1/0000/result.json", b"{}".to_vec())
            .await
            .unwrap();
        assert!(store.head_object("callbacks/runs/run-1/0000/result.json").await.unwrap());
    }

    #[tokio::test]
    async fn put_object_overwrites_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();
        store.put_object("path", b"first".to_vec()).await.unwrap();
        store.put_object("path", b"second".to_vec()).await.unwrap();
        assert_eq!(store.get_object("path").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn presign_put_embeds_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();
        let url = store.presign_put("done/run-1/done", 7200).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(parse_presigned_expiry(&url).is_some());
    }

    #[test]
    fn presigned_url_validity_respects_expiry() {
        let now = Utc::now();
        let url = format!("file:///tmp/x?expires={}", now.timestamp() + 10);
        assert!(presigned_url_is_valid(&url, now));
        assert!(!presigned_url_is_valid(&url, now + chrono::Duration::seconds(20)));
    }

    #[test]
    fn presigned_path_strips_scheme_and_query() {
        let url = "file:///tmp/foo/bar?expires=123";
        assert_eq!(presigned_path(url), Some(Path::new("/tmp/foo/bar")));
    }
}
