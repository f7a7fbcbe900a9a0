//! Object storage for source documents and generated outputs.
//!
//! Objects are addressed by [`ObjectLocation`]. The pipeline only ever stores
//! locations in the job store; bytes stay here.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::ObjectLocation;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(ObjectLocation),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size_bytes: u64,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any existing one at the same location.
    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError>;

    async fn head(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, StorageError>;
}

/// Guess a content type from the key's extension.
pub fn guess_content_type(location: &ObjectLocation) -> Option<String> {
    mime_guess::from_path(&location.key)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// Objects on the local filesystem at `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a location to a path, refusing anything that escapes the root.
    pub fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for part in [location.bucket.as_str(), location.key.as_str()] {
            let relative = Path::new(part);
            if part.is_empty()
                || relative
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(StorageError::InvalidKey(location.to_string()));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(location)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(location.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, StorageError> {
        let path = self.path_for(location)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                size_bytes: meta.len(),
                content_type: guess_content_type(location),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

/// Object store held in memory, for tests and `--memory` runs.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<ObjectLocation, StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys under `prefix` in `bucket`, sorted.
    pub async fn keys_with_prefix(&self, bucket: &str, prefix: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|l| l.bucket == bucket && l.key.starts_with(prefix))
            .map(|l| l.key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        self.objects.write().await.insert(
            location.clone(),
            StoredObject {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(location)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(location.clone()))
    }

    async fn head(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, StorageError> {
        Ok(self.objects.read().await.get(location).map(|o| ObjectMeta {
            size_bytes: o.bytes.len() as u64,
            content_type: o.content_type.clone().or_else(|| guess_content_type(location)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let loc = ObjectLocation::new("docs", "scans/a.txt");

        assert!(store.head(&loc).await.unwrap().is_none());
        store.put(&loc, b"hello".to_vec(), None).await.unwrap();
        assert_eq!(store.get(&loc).await.unwrap(), b"hello");

        let meta = store.head(&loc).await.unwrap().unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert!(dir.path().join("docs/scans/a.txt").exists());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for key in ["../outside", "/etc/passwd", ""] {
            let result = store.path_for(&ObjectLocation::new("docs", key));
            assert!(matches!(result, Err(StorageError::InvalidKey(_))), "{key}");
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = InMemoryObjectStore::new();
        let result = store.get(&ObjectLocation::new("docs", "nope.pdf")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_lists_prefix() {
        let store = InMemoryObjectStore::new();
        for key in ["a.pdf-analysis/x/response.json", "a.pdf-analysis/x/page-1-text.txt", "b.pdf"] {
            store
                .put(&ObjectLocation::new("docs", key), Vec::new(), None)
                .await
                .unwrap();
        }
        let keys = store.keys_with_prefix("docs", "a.pdf-analysis/").await;
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with("page-1-text.txt"));
    }

    #[test]
    fn test_guess_content_type() {
        let loc = ObjectLocation::new("docs", "scan.PDF");
        assert_eq!(guess_content_type(&loc).as_deref(), Some("application/pdf"));
        assert_eq!(guess_content_type(&ObjectLocation::new("docs", "noext")), None);
    }
}
