// SPDX-License-Identifier: MIT OR Apache-2.0
//! Object storage adapter for render artifacts.
//!
//! Screenshots and PDFs are never kept on the rendering host past job
//! completion; they land in an S3-compatible bucket under a key derived
//! from the owning tenant and job, and are served back to callers only via
//! a short-lived presigned URL. This crate knows nothing about jobs or
//! tenants beyond what it needs to build a key — ownership is enforced by
//! the caller, not here.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// MIME types the store will accept for an artifact upload.
pub const ALLOWED_CONTENT_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/webp", "application/pdf"];

/// Errors from the object store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// `content_type` is not in [`ALLOWED_CONTENT_TYPES`].
    #[error("content type '{0}' is not accepted for artifact storage")]
    UnsupportedContentType(String),

    /// The underlying SDK call failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Build the object key for a screenshot artifact: `screenshots/{tenant}/{unix_ms}-{sanitized}.{ext}`.
pub fn screenshot_key(tenant_id: Uuid, name: &str, extension: &str) -> String {
    build_key("screenshots", tenant_id, name, extension)
}

/// Build the object key for a PDF artifact: `pdfs/{tenant}/{unix_ms}-{sanitized}.{ext}`.
pub fn pdf_key(tenant_id: Uuid, name: &str, extension: &str) -> String {
    build_key("pdfs", tenant_id, name, extension)
}

/// Build the object key for an artifact of `kind` belonging to `tenant_id`,
/// namespaced by tenant first so a bucket-level IAM policy or lifecycle
/// rule can be scoped per tenant if needed later.
fn build_key(kind: &str, tenant_id: Uuid, name: &str, extension: &str) -> String {
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{kind}/{tenant_id}/{unix_ms}-{}.{extension}", sanitize_name(name))
}

/// Strip whitespace and shell/filesystem metacharacters from a name used
/// inside an object key, keeping only ASCII alphanumerics, `-`, and `_`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Validate that `content_type` is acceptable for artifact storage.
pub fn validate_content_type(content_type: &str) -> Result<(), StorageError> {
    if ALLOWED_CONTENT_TYPES.contains(&content_type) {
        Ok(())
    } else {
        Err(StorageError::UnsupportedContentType(content_type.to_string()))
    }
}

/// S3-compatible object store for render artifacts.
#[derive(Clone)]
pub struct ArtifactStore {
    client: Client,
    bucket: String,
}

impl ArtifactStore {
    /// Wrap an existing S3 client, scoped to `bucket`.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build an [`ArtifactStore`] from the ambient AWS environment/config,
    /// optionally overriding the endpoint (used to point at a local MinIO
    /// instance in development).
    pub async fn from_env(bucket: impl Into<String>, endpoint_override: Option<&str>) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint_override {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(s3_config.build()), bucket)
    }

    /// Upload `body` to `key` with the given `content_type`.
    pub async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        validate_content_type(content_type)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body.into())
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Download the full object at `key`.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    /// Delete the object at `key`. Deleting a non-existent key is not an
    /// error — S3's delete semantics are idempotent.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Returns `true` if an object exists at `key`.
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found())
                {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(err.to_string()))
                }
            }
        }
    }

    /// Generate a time-limited presigned GET URL for `key`.
    pub async fn presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(presigned.uri().to_string())
    }
}
