//! Artifact storage for generated segments and final renders.
//!
//! Every backend implements [`ObjectStore`]: `put` writes bytes under a key
//! and returns an opaque [`OutputRef`], `get` reads them back. Refs carry a
//! backend scheme (`mem://`, `file://`, `s3://`) so a ref written by one
//! backend is never silently resolved by another.

pub mod keys;
pub mod local;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use foundry_core::config::{StorageBackendKind, StorageConfig};
use foundry_core::types::OutputRef;

pub use keys::{render_key, segment_key};
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(OutputRef),

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Output ref '{0}' does not belong to this store")]
    ForeignRef(OutputRef),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// The storage collaborator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Write `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<OutputRef, StorageError>;

    /// Read the object a previous `put` returned `output_ref` for.
    async fn get(&self, output_ref: &OutputRef) -> Result<Vec<u8>, StorageError>;
}

/// Reject keys that are empty, absolute, or escape their prefix.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Strip `prefix` from `output_ref`, returning the key.
pub(crate) fn key_from_ref<'a>(
    prefix: &str,
    output_ref: &'a OutputRef,
) -> Result<&'a str, StorageError> {
    let key = output_ref
        .strip_prefix(prefix)
        .ok_or_else(|| StorageError::ForeignRef(output_ref.clone()))?;
    validate_key(key).map_err(|_| StorageError::ForeignRef(output_ref.clone()))?;
    Ok(key)
}

/// Build the backend selected by `config`.
pub async fn build_object_store(
    config: &StorageConfig,
) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackendKind::Memory => Arc::new(MemoryObjectStore::new()),
        StorageBackendKind::Local => {
            Arc::new(LocalObjectStore::create(config.local_path.clone()).await?)
        }
        StorageBackendKind::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .ok_or_else(|| StorageError::Backend("S3 bucket is not configured".into()))?;
            Arc::new(S3ObjectStore::from_env(bucket).await)
        }
    };
    tracing::info!(backend = store.backend(), "Object store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn keys_must_be_relative_and_contained() {
        assert!(validate_key("segments/1/2/abc.mp4").is_ok());
        for bad in ["", "/etc/passwd", "a/../b", "a//b", "./a", "a\\b", "a/"] {
            assert_matches!(validate_key(bad), Err(StorageError::InvalidKey(_)), "{bad}");
        }
    }

    #[test]
    fn refs_from_other_backends_are_rejected() {
        let output_ref: OutputRef = "s3://bucket/segments/1.mp4".into();
        assert_matches!(
            key_from_ref("mem://", &output_ref),
            Err(StorageError::ForeignRef(_))
        );
        let output_ref: OutputRef = "mem://../x".into();
        assert_matches!(
            key_from_ref("mem://", &output_ref),
            Err(StorageError::ForeignRef(_))
        );
    }

    #[tokio::test]
    async fn builds_memory_backend() {
        let config = StorageConfig {
            backend: StorageBackendKind::Memory,
            local_path: "./unused".into(),
            s3_bucket: None,
        };
        let store = build_object_store(&config).await.unwrap();
        assert_eq!(store.backend(), "memory");
    }
}
