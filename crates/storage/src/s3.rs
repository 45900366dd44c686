use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use foundry_core::types::OutputRef;

use crate::{key_from_ref, validate_key, ObjectStore, StorageError};

/// [`ObjectStore`] backed by an S3 (or S3-compatible) bucket.
///
/// Refs are `s3://{bucket}/{key}`.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let prefix = format!("s3://{bucket}/");
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Credentials and region come from the standard AWS environment chain.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<OutputRef, StorageError> {
        validate_key(key)?;
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("video/mp4")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(e).to_string()))?;

        tracing::debug!(bucket = %self.bucket, key, bytes = len, "Uploaded object to S3");
        Ok(format!("{}{key}", self.prefix))
    }

    async fn get(&self, output_ref: &OutputRef) -> Result<Vec<u8>, StorageError> {
        let key = key_from_ref(&self.prefix, output_ref)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(output_ref.clone())
                } else {
                    StorageError::Backend(DisplayErrorContext(e).to_string())
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }
}
