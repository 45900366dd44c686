use std::collections::HashMap;

use async_trait::async_trait;
use foundry_core::types::OutputRef;
use tokio::sync::RwLock;

use crate::{key_from_ref, validate_key, ObjectStore, StorageError};

const PREFIX: &str = "mem://";

/// In-process [`ObjectStore`] for developer mode and tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<OutputRef, StorageError> {
        validate_key(key)?;
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(format!("{PREFIX}{key}"))
    }

    async fn get(&self, output_ref: &OutputRef) -> Result<Vec<u8>, StorageError> {
        let key = key_from_ref(PREFIX, output_ref)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(output_ref.clone()))
    }
}
