//! Blob storage for attachments, backups and exports.
//!
//! Paths are relative, `/`-separated and never contain `..`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors from object storage.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for object store operations.
pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// A flat key/blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes an object, replacing any existing one at `path`.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Reads an object.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Removes an object. Removing a missing object is not an error.
    async fn remove(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Lists object paths beginning with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// URL a client can fetch the object from.
    fn public_url(&self, path: &str) -> String;
}

/// Rejects absolute paths, `..` segments and empty paths.
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = || ObjectStoreError::InvalidPath(path.to_string());
    if path.trim().is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(invalid());
    }
    let all_normal = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal || path.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(invalid());
    }
    Ok(())
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

// ============================================================================
// Filesystem
// ============================================================================

/// Stores objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    base_url: String,
    quota_bytes: Option<u64>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            quota_bytes: None,
        }
    }

    /// Caps the total bytes stored under the root.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    /// Walks the root and returns `(relative path, size)` for every file.
    async fn walk(&self) -> Result<Vec<(String, u64)>> {
        let mut files = Vec::new();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(files);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push((key, meta.len()));
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;

        if let Some(quota) = self.quota_bytes {
            let used: u64 = self
                .walk()
                .await?
                .into_iter()
                .filter(|(key, _)| key != path)
                .map(|(_, size)| size)
                .sum();
            let available = quota.saturating_sub(used);
            if data.len() as u64 > available {
                return Err(ObjectStoreError::QuotaExceeded {
                    requested: data.len() as u64,
                    available,
                });
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        debug!(path, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .walk()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn public_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Keeps objects in a map. Used by tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
    quota_bytes: Option<u64>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        validate_path(path)?;
        let mut objects = self.objects.write().await;

        if let Some(quota) = self.quota_bytes {
            let used: u64 = objects
                .iter()
                .filter(|(key, _)| key.as_str() != path)
                .map(|(_, blob)| blob.len() as u64)
                .sum();
            let available = quota.saturating_sub(used);
            if data.len() as u64 > available {
                return Err(ObjectStoreError::QuotaExceeded {
                    requested: data.len() as u64,
                    available,
                });
            }
        }

        objects.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        validate_path(path)?;
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(path.to_string()))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.objects.write().await.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        Ok(self.objects.read().await.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn public_url(&self, path: &str) -> String {
        join_url("memory://objects", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("attachments/u/e/a.pdf").is_ok());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("a/../../b").is_err());
        assert!(validate_path("/abs/path").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_path("a//b").is_err());
    }

    #[test]
    fn traversal_paths_never_touch_the_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects"), "http://localhost");

        tokio_test::block_on(async {
            let escaped = store.put("../outside.txt", Bytes::from_static(b"x")).await;
            assert!(matches!(escaped, Err(ObjectStoreError::InvalidPath(_))));
            tokio_test::assert_ok!(store.put("inside.txt", Bytes::from_static(b"x")).await);
        });
        assert!(!dir.path().join("outside.txt").exists());
        assert!(dir.path().join("objects/inside.txt").exists());
    }

    #[tokio::test]
    async fn memory_store_put_get_remove() {
        let store = MemoryObjectStore::new();
        store.put("a/b.txt", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(store.get("a/b.txt").await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.exists("a/b.txt").await.unwrap());
        store.remove("a/b.txt").await.unwrap();
        store.remove("a/b.txt").await.unwrap();
        assert!(matches!(
            store.get("a/b.txt").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_enforces_quota() {
        let store = MemoryObjectStore::with_quota(8);
        store.put("a", Bytes::from_static(b"12345")).await.unwrap();

        let err = store.put("b", Bytes::from_static(b"12345")).await.unwrap_err();
        assert!(matches!(
            err,
            ObjectStoreError::QuotaExceeded {
                requested: 5,
                available: 3
            }
        ));
        // Replacing an object only counts the new size.
        store.put("a", Bytes::from_static(b"12345678")).await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "https://files.example.com/");

        store.put("backups/u1/b1/manifest.json", Bytes::from_static(b"{}")).await.unwrap();
        store.put("backups/u1/b1/chunk-0000", Bytes::from_static(b"x")).await.unwrap();
        store.put("exports/u1/e.json", Bytes::from_static(b"[]")).await.unwrap();

        let listed = store.list("backups/u1/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                "backups/u1/b1/chunk-0000".to_string(),
                "backups/u1/b1/manifest.json".to_string(),
            ]
        );
        assert_eq!(
            store.public_url("exports/u1/e.json"),
            "https://files.example.com/exports/u1/e.json"
        );
        assert!(matches!(
            store.get("missing").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_store_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "http://localhost").with_quota(4);
        assert!(matches!(
            store.put("big", Bytes::from_static(b"12345")).await,
            Err(ObjectStoreError::QuotaExceeded { .. })
        ));
        assert!(!store.exists("big").await.unwrap());
    }
}
