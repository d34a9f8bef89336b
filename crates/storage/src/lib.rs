//! Object storage for rendered maps.
//!
//! [`ObjectStore`] is the seam the render pipeline uploads through.
//! [`S3ObjectStore`] talks to any S3-compatible endpoint (MinIO in the
//! reference deployment); [`InMemoryObjectStore`] backs tests.

pub mod memory;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;

pub use memory::InMemoryObjectStore;
pub use s3::{S3Config, S3ObjectStore};

/// Content type stored with every uploaded map.
pub const MAP_CONTENT_TYPE: &str = "image/png";

/// Maximum object key length accepted by S3.
const MAX_KEY_LEN: usize = 1024;

/// Put/delete access to the map bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local_path` under `key`, overwriting any
    /// existing object.
    async fn put(&self, local_path: &Path, key: &str) -> Result<(), StorageError>;

    /// Delete `key`. Deleting a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Errors raised by [`ObjectStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Failed to read local file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload failed for key '{key}': {message}")]
    Upload { key: String, message: String },

    #[error("Delete failed for key '{key}': {message}")]
    Delete { key: String, message: String },

    #[error("Bucket '{bucket}' unavailable: {message}")]
    Bucket { bucket: String, message: String },
}

/// Validate an object key before it reaches the backend.
///
/// Rules:
/// - Must not be empty or exceed `MAX_KEY_LEN` bytes.
/// - Must not start with `/`.
/// - Must not contain `..` path segments.
pub fn validate_object_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason| StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    if key.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(invalid("exceeds 1024 bytes"));
    }
    if key.starts_with('/') {
        return Err(invalid("must not start with '/'"));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(invalid("must not contain '..' segments"));
    }
    Ok(())
}
