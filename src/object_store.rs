//! A simplified object store interface with an S3 implementation.
//! It attempts to hide the complexities of working with the AWS SDK for S3.

use crate::error::IngestError;
use crate::resource_manager::ResourceManager;

use async_trait::async_trait;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Instrument;
use url::Url;

/// User metadata attached to an object.
pub type ObjectMetadata = HashMap<String, String>;

/// Object store trait.
///
/// Defines the get/put/list contract the ingestion pipeline and the HTTP API rely on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download an object.
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    /// * `limit`: Optional maximum size in bytes. Larger objects fail with
    ///   [IngestError::ArchiveTooLarge].
    async fn get(&self, bucket: &str, key: &str, limit: Option<u64>)
        -> Result<Bytes, IngestError>;

    /// Returns the user metadata of an object.
    async fn head_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, IngestError>;

    /// Upload an object, replacing any existing object with the same key.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<(), IngestError>;

    /// List the keys of all objects under a prefix.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, IngestError>;
}

/// Object store shared between tasks.
pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// S3 implementation of [ObjectStore].
#[derive(Clone)]
pub struct S3ObjectStore {
    /// Underlying AWS SDK S3 client object.
    client: Client,
    /// Bounds the number of concurrent requests.
    resource_manager: Arc<ResourceManager>,
}

impl S3ObjectStore {
    /// Creates an S3ObjectStore object
    ///
    /// Credentials and region are resolved from the environment.
    ///
    /// # Arguments
    ///
    /// * `config`: Shared AWS SDK configuration
    /// * `endpoint`: Optional S3-compatible endpoint URL
    /// * `resource_manager`: ResourceManager used to limit concurrent connections
    pub fn new(
        config: &aws_config::SdkConfig,
        endpoint: Option<&Url>,
        resource_manager: Arc<ResourceManager>,
    ) -> Self {
        let mut builder =
            aws_sdk_s3::config::Builder::from(config).behavior_version(BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            tracing::info!("Using S3 endpoint {}", endpoint);
            builder = builder
                .endpoint_url(endpoint.to_string())
                .force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            resource_manager,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        limit: Option<u64>,
    ) -> Result<Bytes, IngestError> {
        // Acquire connection permit to be freed via drop when this function returns
        let _conn_permit = self.resource_manager.s3_connection().await?;
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .instrument(tracing::Span::current())
            .await;
        let mut response = match result {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(IngestError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let content_length: u64 = response.content_length().unwrap_or_default().try_into()?;
        if let Some(limit) = limit {
            if content_length > limit {
                return Err(IngestError::ArchiveTooLarge {
                    size: content_length,
                    limit,
                });
            }
        }

        let mut buf = Vec::with_capacity(content_length.try_into()?);
        // Iterate over the streaming response, copying data into the Vec<u8>.
        while let Some(bytes) = response
            .body
            .try_next()
            .instrument(tracing::Span::current())
            .await?
        {
            buf.extend_from_slice(&bytes)
        }
        Ok(buf.into())
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn head_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, IngestError> {
        let _conn_permit = self.resource_manager.s3_connection().await?;
        let result = self.client.head_object().bucket(bucket).key(key).send().await;
        match result {
            Ok(response) => Ok(response.metadata().cloned().unwrap_or_default()),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                Err(IngestError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = "DEBUG", skip(self, body, metadata), fields(size = body.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<(), IngestError> {
        let _conn_permit = self.resource_manager.s3_connection().await?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .set_metadata(Some(metadata.clone()))
            .body(ByteStream::from(body))
            .send()
            .instrument(tracing::Span::current())
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
        let _conn_permit = self.resource_manager.s3_connection().await?;
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}

/// Returns the base name of an object key or archive entry path.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
