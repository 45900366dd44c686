use std::path::{Path, PathBuf};

use async_trait::async_trait;
use foundry_core::types::OutputRef;

use crate::{key_from_ref, validate_key, ObjectStore, StorageError};

const PREFIX: &str = "file://";

/// [`ObjectStore`] rooted at a directory on local disk.
///
/// Refs are `file://{key}` relative to the root, so the root can move
/// without invalidating stored refs.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Use `root`, creating it if needed.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<OutputRef, StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never observe a partially written object.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(key, bytes = bytes.len(), "Stored object on local disk");
        Ok(format!("{PREFIX}{key}"))
    }

    async fn get(&self, output_ref: &OutputRef) -> Result<Vec<u8>, StorageError> {
        let key = key_from_ref(PREFIX, output_ref)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(output_ref.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn writes_nested_keys_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::create(dir.path().join("objects")).await.unwrap();

        let output_ref = store
            .put("segments/1/2/fp.mp4", b"clip".to_vec())
            .await
            .unwrap();
        assert_eq!(output_ref, "file://segments/1/2/fp.mp4");
        assert!(dir.path().join("objects/segments/1/2/fp.mp4").is_file());
        assert!(!dir.path().join("objects/segments/1/2/fp.part").exists());
        assert_eq!(store.get(&output_ref).await.unwrap(), b"clip");
    }

    #[tokio::test]
    async fn missing_and_foreign_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::create(dir.path()).await.unwrap();

        assert_matches!(
            store.get(&"file://renders/9/9.mp4".to_string()).await,
            Err(StorageError::NotFound(_))
        );
        assert_matches!(
            store.get(&"mem://renders/9/9.mp4".to_string()).await,
            Err(StorageError::ForeignRef(_))
        );
        assert_matches!(
            store.put("../escape.mp4", vec![1]).await,
            Err(StorageError::InvalidKey(_))
        );
    }
}
