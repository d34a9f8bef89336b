//! S3-compatible object store backed by `aws-sdk-s3`.

use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::{validate_object_key, ObjectStore, StorageError, MAP_CONTENT_TYPE};

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone)]
pub struct S3Config {
    /// Endpoint with or without scheme, e.g. `minio:9000`.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    /// Use `https` when the endpoint carries no scheme.
    pub secure: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("secure", &self.secure)
            .finish()
    }
}

/// Give a scheme-less `endpoint` the scheme implied by `secure`. An
/// explicit `http://` or `https://` is kept as given.
pub fn normalize_endpoint(endpoint: &str, secure: bool) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{trimmed}")
}

/// Object store for one bucket on an S3-compatible endpoint.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build the client and make sure the bucket exists.
    pub async fn connect(config: &S3Config) -> Result<Self, StorageError> {
        let endpoint = normalize_endpoint(&config.endpoint, config.secure);
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "meteomap-env",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        // MinIO and most self-hosted stores only support path-style URLs.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        let store = Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        };

        tracing::info!(endpoint = %endpoint, bucket = %store.bucket, "S3 client created");
        store.ensure_bucket().await?;
        Ok(store)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e)
                if matches!(
                    e.code(),
                    Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists")
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(StorageError::Bucket {
                bucket: self.bucket.clone(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, local_path: &Path, key: &str) -> Result<(), StorageError> {
        validate_object_key(key)?;

        let data = tokio::fs::read(local_path).await?;
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(MAP_CONTENT_TYPE)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::info!(key, size, bucket = %self.bucket, "Uploaded map");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_object_key(key)?;

        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                tracing::info!(key, bucket = %self.bucket, "Deleted map");
                Ok(())
            }
            Err(e) if e.code() == Some("NoSuchKey") => {
                tracing::debug!(key, "Map already absent");
                Ok(())
            }
            Err(e) => Err(StorageError::Delete {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }
}
